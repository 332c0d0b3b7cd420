//! Error types for the bulk mailer.
//!
//! Two layers:
//! - [`SmtpError`] covers everything below the mailer (transport, protocol,
//!   authentication, message encoding) and carries SMTP reply codes.
//! - [`MailerError`] is what the top-level mailer operations return.

use std::fmt;
use thiserror::Error;

use crate::store::LogStoreError;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Result type for mailer operations.
pub type MailerResult<T> = Result<T, MailerError>;

/// SMTP error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection errors
    /// DNS resolution failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or closed by the server.
    ConnectionReset,
    /// No session is established.
    NotConnected,

    // TLS errors
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// Certificate bundle could not be loaded.
    CertificateInvalid,
    /// STARTTLS not supported by server.
    StarttlsNotSupported,

    // Authentication errors
    /// Credentials were rejected.
    CredentialsInvalid,
    /// No usable authentication mechanism.
    AuthMethodNotSupported,
    /// Server requires authentication.
    AuthenticationRequired,

    // Protocol errors
    /// Malformed response from server.
    InvalidResponse,
    /// Unexpected response code.
    UnexpectedResponse,
    /// Server is shutting down (421).
    ServerShutdown,

    // Message errors
    /// Sender address rejected or malformed.
    InvalidFromAddress,
    /// Recipient address rejected or malformed.
    InvalidRecipientAddress,
    /// Message exceeds size limit.
    MessageTooLarge,
    /// Invalid header value.
    InvalidHeader,

    // Timeout errors
    /// Connect timeout.
    ConnectTimeout,
    /// Read timeout.
    ReadTimeout,
    /// Write timeout.
    WriteTimeout,

    // Configuration errors
    /// Configuration is invalid.
    ConfigurationInvalid,

    /// Unknown or internal error.
    Unknown,
}

impl SmtpErrorKind {
    /// Returns true for failures that happen before or during session setup.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            SmtpErrorKind::DnsResolution
                | SmtpErrorKind::ConnectionRefused
                | SmtpErrorKind::ConnectionReset
                | SmtpErrorKind::NotConnected
                | SmtpErrorKind::TlsHandshakeFailed
                | SmtpErrorKind::CertificateInvalid
                | SmtpErrorKind::StarttlsNotSupported
                | SmtpErrorKind::CredentialsInvalid
                | SmtpErrorKind::AuthMethodNotSupported
                | SmtpErrorKind::AuthenticationRequired
                | SmtpErrorKind::ConnectTimeout
        )
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SmtpErrorKind::DnsResolution => "DNS resolution failed",
            SmtpErrorKind::ConnectionRefused => "Connection refused",
            SmtpErrorKind::ConnectionReset => "Connection reset",
            SmtpErrorKind::NotConnected => "Not connected",
            SmtpErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            SmtpErrorKind::CertificateInvalid => "Invalid certificate",
            SmtpErrorKind::StarttlsNotSupported => "STARTTLS not supported",
            SmtpErrorKind::CredentialsInvalid => "Invalid credentials",
            SmtpErrorKind::AuthMethodNotSupported => "Auth method not supported",
            SmtpErrorKind::AuthenticationRequired => "Authentication required",
            SmtpErrorKind::InvalidResponse => "Invalid server response",
            SmtpErrorKind::UnexpectedResponse => "Unexpected response",
            SmtpErrorKind::ServerShutdown => "Server shutting down",
            SmtpErrorKind::InvalidFromAddress => "Invalid sender address",
            SmtpErrorKind::InvalidRecipientAddress => "Invalid recipient address",
            SmtpErrorKind::MessageTooLarge => "Message too large",
            SmtpErrorKind::InvalidHeader => "Invalid header",
            SmtpErrorKind::ConnectTimeout => "Connect timeout",
            SmtpErrorKind::ReadTimeout => "Read timeout",
            SmtpErrorKind::WriteTimeout => "Write timeout",
            SmtpErrorKind::ConfigurationInvalid => "Invalid configuration",
            SmtpErrorKind::Unknown => "Unknown error",
        };
        f.write_str(text)
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !(2..=5).contains(&class) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns true if the session can no longer be used.
    pub fn is_connection_failure(&self) -> bool {
        self.kind.is_connection_failure()
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    // Convenience constructors

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionRefused, message)
    }

    /// Creates an error for operations that need a live session.
    pub fn not_connected() -> Self {
        Self::new(SmtpErrorKind::NotConnected, "No SMTP session is established")
    }

    /// Creates a timeout error.
    pub fn timeout(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a message error.
    pub fn message_error(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates an error from an SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            500..=504 => SmtpErrorKind::InvalidResponse,
            530 => SmtpErrorKind::AuthenticationRequired,
            534 | 535 => SmtpErrorKind::CredentialsInvalid,
            550 | 551 => SmtpErrorKind::InvalidRecipientAddress,
            552 => SmtpErrorKind::MessageTooLarge,
            553 => SmtpErrorKind::InvalidFromAddress,
            400..=599 => SmtpErrorKind::UnexpectedResponse,
            _ => SmtpErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// Errors returned by the top-level mailer operations.
#[derive(Error, Debug)]
pub enum MailerError {
    /// The SMTP session could not be established.
    #[error("failed to connect to SMTP server: {0}")]
    Connection(#[source] SmtpError),

    /// The delivery log could not be written.
    #[error("delivery log error: {0}")]
    Store(#[from] LogStoreError),

    /// Configuration or campaign input is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The operation is not allowed in the mailer's current state.
    #[error("invalid mailer state: {0}")]
    InvalidState(String),
}

impl MailerError {
    /// Returns the SMTP error behind a connection failure.
    pub fn smtp_error(&self) -> Option<&SmtpError> {
        match self {
            MailerError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());

        assert!(EnhancedStatusCode::parse("smtp.example.com").is_none());
        assert!(EnhancedStatusCode::parse("1.2.3").is_none());
        assert!(EnhancedStatusCode::parse("5.1.1.1").is_none());
    }

    #[test]
    fn test_smtp_error_from_response() {
        let err = SmtpError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
        assert_eq!(err.smtp_code(), Some(535));

        let err = SmtpError::from_smtp_response(550, "No such user");
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);

        let err = SmtpError::from_smtp_response(451, "Try again later");
        assert_eq!(err.kind(), SmtpErrorKind::UnexpectedResponse);
    }

    #[test]
    fn test_connection_failure_follows_kind() {
        assert!(SmtpError::new(SmtpErrorKind::ConnectionReset, "closed").is_connection_failure());
        assert!(SmtpError::not_connected().is_connection_failure());
        assert!(!SmtpError::from_smtp_response(550, "No such user").is_connection_failure());
    }

    #[test]
    fn test_display_includes_codes() {
        let err = SmtpError::from_smtp_response(550, "User unknown")
            .with_enhanced_code(EnhancedStatusCode::parse("5.1.1").unwrap());
        let text = err.to_string();
        assert!(text.contains("User unknown"));
        assert!(text.contains("(SMTP 550)"));
        assert!(text.contains("[5.1.1]"));
    }

    #[test]
    fn test_connection_failure_kinds() {
        assert!(SmtpErrorKind::CredentialsInvalid.is_connection_failure());
        assert!(SmtpErrorKind::StarttlsNotSupported.is_connection_failure());
        assert!(!SmtpErrorKind::InvalidRecipientAddress.is_connection_failure());
    }

    #[test]
    fn test_mailer_error_keeps_source() {
        let err = MailerError::Connection(SmtpError::authentication("535 rejected"));
        assert_eq!(
            err.smtp_error().map(|e| e.kind()),
            Some(SmtpErrorKind::CredentialsInvalid)
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
