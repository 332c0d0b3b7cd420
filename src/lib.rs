//! # Bulk Mailer
//!
//! Sends one plain-text message to a list of recipients over an
//! authenticated SMTP session, pausing a random number of seconds
//! between sends and recording every attempt in a SQLite delivery log.
//!
//! - SMTP submission with STARTTLS or implicit TLS (rustls)
//! - AUTH PLAIN and AUTH LOGIN
//! - One `email_logs` row per attempt, success or failure
//! - Per-recipient failures are logged and the batch continues
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bulk_mailer::{BulkMailer, DelayRange, DeliveryLogStore, MailerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MailerConfig::builder()
//!         .host("smtp.gmail.com")
//!         .port(587)
//!         .credentials("your_email@gmail.com", "your_password")
//!         .build()?;
//!
//!     let store = DeliveryLogStore::open(&config.database_path)?;
//!     let mut mailer = BulkMailer::new(config, store);
//!
//!     mailer.connect().await?;
//!     mailer
//!         .send_bulk(
//!             ["recipient1@example.com", "recipient2@example.com"],
//!             "Test Email",
//!             "This is a test email.",
//!             DelayRange::new(1, 5)?,
//!         )
//!         .await?;
//!     mailer.close().await;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Protocol and transport
pub mod protocol;
pub mod transport;
pub mod auth;
pub mod message;
pub mod session;

// Delivery log
pub mod store;

// Mailer
pub mod mailer;
pub mod campaign;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use campaign::Campaign;
pub use config::{DelayRange, MailerConfig, MailerConfigBuilder, TlsConfig, TlsMode};
pub use errors::{MailerError, MailerResult, SmtpError, SmtpErrorKind, SmtpResult};
pub use mailer::{BulkMailer, BulkSendReport, MailerState, RecipientOutcome, SendOutcome};
pub use session::{DeliveryReceipt, SmtpSession};
pub use store::{DeliveryLogEntry, DeliveryLogStore, DeliveryStatus, LogStoreError};
pub use auth::{AuthMethod, Credentials};
pub use message::{Address, MessageEncoder, PlainTextMessage};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::{SmtpTransport, TcpConnector, TcpTransport, TransportConnector};
pub use observability::{LogFormat, LoggingConfig, MailerMetrics};
