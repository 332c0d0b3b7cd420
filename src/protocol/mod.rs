//! SMTP protocol implementation.
//!
//! RFC 5321 commands and replies, plus the handful of ESMTP
//! extensions the mailer looks at.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: AuthMethod,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, without angle brackets.
        address: String,
        /// SIZE parameter, sent when the server advertises SIZE.
        size: Option<usize>,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address, without angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending (without the trailing CRLF).
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth {
                mechanism,
                initial_response: None,
            } => format!("AUTH {}", mechanism),
            SmtpCommand::MailFrom { address, size } => match size {
                Some(s) => format!("MAIL FROM:<{}> SIZE={}", address, s),
                None => format!("MAIL FROM:<{}>", address),
            },
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns a form that is safe to write to logs.
    pub fn redacted(&self) -> String {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {} ****", mechanism),
            other => other.to_smtp_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Creates a multiline response.
    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: lines,
        }
    }

    /// Parses a response from raw lines (CRLF already stripped).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid status line: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol("Inconsistent status codes in multiline response"));
            }

            let text = line.get(4..).unwrap_or("");
            let text = if i == 0 {
                match Self::parse_enhanced_code(text) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest
                    }
                    None => text,
                }
            } else {
                text
            };

            messages.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
        })
    }

    /// Splits a leading enhanced status code off a reply text.
    fn parse_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
        let code = EnhancedStatusCode::parse(head)?;
        Some((code, rest.trim()))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a positive intermediate response (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns true if this is a permanent failure (5xx).
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts to an error.
    pub fn to_error(&self) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }

    /// Returns `Ok(self)` for `expected`, the reply as an error otherwise.
    pub fn expect_code(self, expected: u16) -> SmtpResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }

    /// Returns `Ok(self)` for any 2xx reply, the reply as an error otherwise.
    pub fn expect_success(self) -> SmtpResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from EHLO response. The first line is the
    /// server greeting and is skipped.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                // Some servers still advertise the pre-standard AUTH=... form
                "AUTH" | "AUTH=" => {
                    caps.auth_mechanisms
                        .extend(params.split_whitespace().filter_map(AuthMethod::from_capability));
                }
                _ if capability.starts_with("AUTH=") => {
                    caps.auth_mechanisms.extend(
                        line[5..].split_whitespace().filter_map(AuthMethod::from_capability),
                    );
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }

            caps.raw.push(line);
        }

        caps
    }

    /// Returns the advertised mechanisms the mailer can use.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }

    /// Checks if a specific capability is supported.
    pub fn has_capability(&self, name: &str) -> bool {
        let upper = name.to_uppercase();
        self.raw.iter().any(|c| c.starts_with(&upper))
    }
}

/// SMTP session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// TCP connected, greeting not yet read.
    Initial,
    /// Received server greeting.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// TLS established.
    TlsEstablished,
    /// Authenticated.
    Authenticated,
    /// In mail transaction (after MAIL FROM).
    InTransaction,
    /// Recipients added (after RCPT TO).
    RecipientsAdded,
    /// Sending data (after DATA).
    SendingData,
    /// Transaction complete.
    Complete,
    /// Connection closed.
    Closed,
}

impl TransactionState {
    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(
            self,
            TransactionState::Greeted
                | TransactionState::TlsEstablished
                | TransactionState::Authenticated
                | TransactionState::Complete
        )
    }

    /// Returns true if the server may be left mid-transaction and needs RSET.
    pub fn needs_reset(&self) -> bool {
        matches!(
            self,
            TransactionState::InTransaction
                | TransactionState::RecipientsAdded
                | TransactionState::SendingData
        )
    }
}

/// Reply codes the mailer checks for.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}
