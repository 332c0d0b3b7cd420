//! The bulk mailer.
//!
//! [`BulkMailer`] owns one SMTP session and a handle to the delivery
//! log. Its lifecycle is `Unconnected -> Connected -> Closed`:
//!
//! ```no_run
//! use bulk_mailer::{BulkMailer, DelayRange, DeliveryLogStore, MailerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MailerConfig::from_env()?;
//! let store = DeliveryLogStore::open(&config.database_path)?;
//! let mut mailer = BulkMailer::new(config, store);
//!
//! mailer.connect().await?;
//! let report = mailer
//!     .send_bulk(["a@example.com", "b@example.com"], "Hello", "Hi there", DelayRange::default())
//!     .await?;
//! println!("{} of {} delivered", report.succeeded, report.total);
//! mailer.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;

use crate::campaign::Campaign;
use crate::config::{DelayRange, MailerConfig};
use crate::errors::{MailerError, MailerResult, SmtpError, SmtpResult};
use crate::message::PlainTextMessage;
use crate::observability::{MailerMetrics, MetricsSnapshot};
use crate::session::{DeliveryReceipt, SmtpSession};
use crate::store::{DeliveryLogStore, DeliveryStatus};
use crate::transport::{TcpConnector, TransportConnector};

/// Lifecycle state of a [`BulkMailer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailerState {
    /// No session yet, or the last connect failed.
    Unconnected,
    /// An authenticated session is open.
    Connected,
    /// Closed; terminal.
    Closed,
}

/// Result of a single send attempt.
#[derive(Debug)]
pub enum SendOutcome {
    /// The server accepted the message.
    Success(DeliveryReceipt),
    /// The message was not delivered.
    Failed(SmtpError),
}

impl SendOutcome {
    /// Returns true if the message was accepted.
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success(_))
    }

    /// Returns the status recorded for this outcome.
    pub fn status(&self) -> DeliveryStatus {
        match self {
            SendOutcome::Success(_) => DeliveryStatus::Success,
            SendOutcome::Failed(_) => DeliveryStatus::Failed,
        }
    }

    /// Returns the failure cause, if any.
    pub fn error(&self) -> Option<&SmtpError> {
        match self {
            SendOutcome::Failed(e) => Some(e),
            SendOutcome::Success(_) => None,
        }
    }

    /// Returns the receipt, if any.
    pub fn receipt(&self) -> Option<&DeliveryReceipt> {
        match self {
            SendOutcome::Success(r) => Some(r),
            SendOutcome::Failed(_) => None,
        }
    }
}

impl From<SmtpResult<DeliveryReceipt>> for SendOutcome {
    fn from(result: SmtpResult<DeliveryReceipt>) -> Self {
        match result {
            Ok(receipt) => SendOutcome::Success(receipt),
            Err(e) => SendOutcome::Failed(e),
        }
    }
}

/// Outcome for one recipient of a bulk send.
#[derive(Debug)]
pub struct RecipientOutcome {
    /// Recipient as given.
    pub recipient: String,
    /// What happened.
    pub outcome: SendOutcome,
}

/// Summary of a [`BulkMailer::send_bulk`] call.
#[derive(Debug)]
pub struct BulkSendReport {
    /// Number of recipients attempted.
    pub total: usize,
    /// Number accepted by the server.
    pub succeeded: usize,
    /// Number that failed.
    pub failed: usize,
    /// Per-recipient outcomes in input order.
    pub outcomes: Vec<RecipientOutcome>,
    /// Wall time including pauses.
    pub duration: Duration,
}

impl BulkSendReport {
    fn new() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            outcomes: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn push(&mut self, recipient: String, outcome: SendOutcome) {
        self.total += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(RecipientOutcome { recipient, outcome });
    }

    /// Returns true if every recipient was accepted.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Sends one message to many recipients, one at a time, logging
/// each attempt.
pub struct BulkMailer {
    config: MailerConfig,
    store: DeliveryLogStore,
    connector: Box<dyn TransportConnector>,
    session: Option<SmtpSession>,
    state: MailerState,
    metrics: Arc<MailerMetrics>,
    rng: StdRng,
}

impl fmt::Debug for BulkMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkMailer")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("sender", &self.config.sender)
            .field("state", &self.state)
            .finish()
    }
}

impl BulkMailer {
    /// Creates a mailer that connects over TCP.
    pub fn new(config: MailerConfig, store: DeliveryLogStore) -> Self {
        Self::with_connector(config, store, TcpConnector)
    }

    /// Creates a mailer with a custom transport connector.
    pub fn with_connector(
        config: MailerConfig,
        store: DeliveryLogStore,
        connector: impl TransportConnector + 'static,
    ) -> Self {
        Self {
            config,
            store,
            connector: Box::new(connector),
            session: None,
            state: MailerState::Unconnected,
            metrics: Arc::new(MailerMetrics::new()),
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeds the delay sampler, for reproducible pacing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> MailerState {
        self.state
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MailerConfig {
        &self.config
    }

    /// Returns the delivery log handle.
    pub fn store(&self) -> &DeliveryLogStore {
        &self.store
    }

    /// Returns a snapshot of the delivery counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Opens and authenticates the SMTP session.
    ///
    /// A no-op when already connected. On failure the mailer stays
    /// `Unconnected` and may be connected again.
    pub async fn connect(&mut self) -> MailerResult<()> {
        match self.state {
            MailerState::Connected => return Ok(()),
            MailerState::Closed => {
                return Err(MailerError::InvalidState(
                    "cannot connect a closed mailer".to_string(),
                ))
            }
            MailerState::Unconnected => {}
        }

        tracing::debug!(
            address = %self.config.address(),
            tls = ?self.config.tls.mode,
            "Connecting"
        );

        match self.open_session().await {
            Ok(session) => {
                self.metrics.record_connection_attempt(true);
                tracing::info!(tls = session.is_tls(), "Connected to SMTP server.");
                self.session = Some(session);
                self.state = MailerState::Connected;
                Ok(())
            }
            Err(e) => {
                self.metrics.record_connection_attempt(false);
                tracing::error!("Failed to connect to SMTP server: {}", e);
                Err(MailerError::Connection(e))
            }
        }
    }

    async fn open_session(&self) -> SmtpResult<SmtpSession> {
        let transport = self.connector.connect(&self.config).await?;
        SmtpSession::establish(transport, &self.config).await
    }

    /// Sends one message and records the attempt.
    ///
    /// Delivery failures, including having no session, come back as
    /// [`SendOutcome::Failed`]. Only a failure to write the log entry
    /// is returned as an error.
    pub async fn send_one(
        &mut self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> MailerResult<SendOutcome> {
        let outcome: SendOutcome = self.deliver(recipient, subject, body).await.into();

        match &outcome {
            SendOutcome::Success(_) => {
                self.metrics.record_send_success();
                tracing::info!("Email sent to {}", recipient);
            }
            SendOutcome::Failed(e) => {
                self.metrics.record_send_failure();
                tracing::warn!("Failed to send email to {}: {}", recipient, e);
            }
        }

        let id = self.store.append(recipient, subject, outcome.status())?;
        tracing::debug!(id, status = %outcome.status(), "Delivery logged");

        Ok(outcome)
    }

    async fn deliver(
        &mut self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> SmtpResult<DeliveryReceipt> {
        let session = match (self.state, self.session.as_mut()) {
            (MailerState::Connected, Some(session)) => session,
            _ => return Err(SmtpError::not_connected()),
        };

        let message = PlainTextMessage::builder()
            .from(self.config.sender.as_str())
            .to(recipient)
            .subject(subject)
            .body(body)
            .build()?;

        session.submit(&message).await
    }

    /// Sends the same message to each recipient in order, pausing for a
    /// random whole number of seconds from `delay` after every send.
    pub async fn send_bulk<I, S>(
        &mut self,
        recipients: I,
        subject: &str,
        body: &str,
        delay: DelayRange,
    ) -> MailerResult<BulkSendReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        delay
            .validate()
            .map_err(|e| MailerError::Configuration(e.message().to_string()))?;

        let start = Instant::now();
        let mut report = BulkSendReport::new();

        for recipient in recipients {
            let recipient = recipient.as_ref();
            let outcome = self.send_one(recipient, subject, body).await?;
            report.push(recipient.to_string(), outcome);

            let pause = delay.sample(&mut self.rng);
            tracing::info!(
                "Waiting for {} seconds before sending the next email...",
                pause.as_secs()
            );
            self.metrics.record_delay(pause);
            tokio::time::sleep(pause).await;
        }

        report.duration = start.elapsed();
        tracing::info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "Bulk send finished"
        );
        Ok(report)
    }

    /// Sends a campaign, using its delay or the configured one.
    pub async fn send_campaign(&mut self, campaign: &Campaign) -> MailerResult<BulkSendReport> {
        let delay = campaign.delay.unwrap_or(self.config.delay);
        self.send_bulk(&campaign.recipients, &campaign.subject, &campaign.body, delay)
            .await
    }

    /// Quits the session and closes the delivery log.
    ///
    /// Idempotent and safe without a prior connect. Errors are logged,
    /// not returned.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.quit().await {
                Ok(()) => tracing::debug!("SMTP session closed"),
                Err(e) => tracing::warn!("Error while closing SMTP session: {}", e),
            }
        }

        if self.store.is_open() {
            if let Err(e) = self.store.close() {
                tracing::error!("Failed to close delivery log: {}", e);
            }
        }

        self.state = MailerState::Closed;
    }
}
