//! Authenticated SMTP session.
//!
//! [`SmtpSession::establish`] drives a freshly connected transport
//! through EHLO, STARTTLS and AUTH. [`SmtpSession::submit`] then runs
//! one MAIL/RCPT/DATA transaction per message.

use std::time::{Duration, Instant};

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{MailerConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::message::{MessageEncoder, PlainTextMessage};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::SmtpTransport;

/// Server acknowledgement of an accepted message.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Recipient the message was accepted for.
    pub recipient: String,
    /// Final reply text after the message data.
    pub response: String,
    /// Size of the transmitted DATA payload in bytes.
    pub size: usize,
    /// Time spent in the transaction.
    pub duration: Duration,
}

/// An SMTP connection that has completed the handshake.
#[derive(Debug)]
pub struct SmtpSession {
    transport: Box<dyn SmtpTransport>,
    authenticated: bool,
}

impl SmtpSession {
    /// Runs the handshake on a connected transport.
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn establish(
        mut transport: Box<dyn SmtpTransport>,
        config: &MailerConfig,
    ) -> SmtpResult<Self> {
        match Self::handshake(transport.as_mut(), config).await {
            Ok(authenticated) => Ok(Self {
                transport,
                authenticated,
            }),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(error = %close_err, "Failed to close after handshake error");
                }
                Err(e)
            }
        }
    }

    async fn handshake(
        transport: &mut dyn SmtpTransport,
        config: &MailerConfig,
    ) -> SmtpResult<bool> {
        greet(transport, config.client_id()).await?;

        if !transport.is_tls() {
            match config.tls.mode {
                TlsMode::StartTls | TlsMode::StartTlsRequired => {
                    start_tls(transport, config).await?;
                }
                TlsMode::Implicit => {
                    return Err(SmtpError::tls("Implicit TLS transport is not encrypted"));
                }
                TlsMode::None => {}
            }
        }

        match config.credentials() {
            Some(credentials) => {
                let allow_plaintext = config.tls.mode == TlsMode::None;
                authenticate(transport, &credentials, allow_plaintext).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns true if the session authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns true if the session is encrypted.
    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Returns the capabilities from the last EHLO.
    pub fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.transport.capabilities()
    }

    /// Submits one message.
    ///
    /// A failed transaction is followed by a best-effort RSET so the
    /// next submission starts from a clean state.
    pub async fn submit(&mut self, message: &PlainTextMessage) -> SmtpResult<DeliveryReceipt> {
        let start = Instant::now();
        let result = self.transaction(message).await;

        match result {
            Ok((response, size)) => Ok(DeliveryReceipt {
                recipient: message.recipient().email().to_string(),
                response,
                size,
                duration: start.elapsed(),
            }),
            Err(e) => {
                if self.transport.state().needs_reset() {
                    self.reset().await;
                }
                Err(e)
            }
        }
    }

    async fn transaction(&mut self, message: &PlainTextMessage) -> SmtpResult<(String, usize)> {
        let state = self.transport.state();
        if state == TransactionState::Closed {
            return Err(SmtpError::not_connected());
        }
        if !state.can_start_mail() {
            return Err(SmtpError::protocol(format!(
                "Cannot start a mail transaction in state {:?}",
                state
            )));
        }

        let encoded = MessageEncoder::new().encode(message)?;
        let data = MessageEncoder::prepare_data_content(&encoded);

        let size_limit = self.transport.capabilities().and_then(|c| c.size);
        if let Some(max) = size_limit {
            if data.len() > max {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message is {} bytes, server accepts {}", data.len(), max),
                ));
            }
        }

        let mail_from = SmtpCommand::MailFrom {
            address: message.sender().email().to_string(),
            size: size_limit.map(|_| data.len()),
        };
        self.transport.send_command(&mail_from).await?.expect_success()?;
        self.transport.set_state(TransactionState::InTransaction);

        let rcpt_to = SmtpCommand::RcptTo {
            address: message.recipient().email().to_string(),
        };
        self.transport.send_command(&rcpt_to).await?.expect_success()?;
        self.transport.set_state(TransactionState::RecipientsAdded);

        self.transport
            .send_command(&SmtpCommand::Data)
            .await?
            .expect_code(codes::START_MAIL_INPUT)?;
        self.transport.set_state(TransactionState::SendingData);

        self.transport.send_data(&data).await?;
        let response = self.transport.read_response().await?.expect_success()?;
        self.transport.set_state(TransactionState::Complete);

        tracing::debug!(
            recipient = %message.recipient(),
            size = data.len(),
            response = %response,
            "Message accepted"
        );

        Ok((response.full_message(), data.len()))
    }

    /// Sends RSET, ignoring failures.
    async fn reset(&mut self) {
        match self.transport.send_command(&SmtpCommand::Rset).await {
            Ok(response) if response.is_success() => {
                self.transport.set_state(TransactionState::Complete);
            }
            Ok(response) => tracing::debug!(response = %response, "RSET refused"),
            Err(e) => tracing::debug!(error = %e, "RSET failed"),
        }
    }

    /// Sends QUIT and closes the connection.
    pub async fn quit(&mut self) -> SmtpResult<()> {
        self.transport.close().await
    }
}

/// Sends EHLO, falling back to HELO, and stores the capabilities.
async fn greet(transport: &mut dyn SmtpTransport, client_id: &str) -> SmtpResult<()> {
    let response = transport
        .send_command(&SmtpCommand::Ehlo(client_id.to_string()))
        .await?;

    let capabilities = if response.is_success() {
        EsmtpCapabilities::from_ehlo_response(&response)
    } else {
        tracing::debug!(response = %response, "EHLO refused, falling back to HELO");
        transport
            .send_command(&SmtpCommand::Helo(client_id.to_string()))
            .await?
            .expect_success()?;
        EsmtpCapabilities::default()
    };

    transport.set_capabilities(capabilities);
    transport.set_state(TransactionState::Greeted);
    Ok(())
}

/// Upgrades via STARTTLS and greets again over the encrypted channel.
async fn start_tls(transport: &mut dyn SmtpTransport, config: &MailerConfig) -> SmtpResult<()> {
    let required = config.tls.mode == TlsMode::StartTlsRequired;
    let advertised = transport.capabilities().map(|c| c.starttls).unwrap_or(false);

    if !advertised {
        if required {
            return Err(SmtpError::new(
                SmtpErrorKind::StarttlsNotSupported,
                "Server does not advertise STARTTLS",
            ));
        }
        tracing::warn!(host = %config.host, "STARTTLS not offered, continuing without TLS");
        return Ok(());
    }

    let response = transport.send_command(&SmtpCommand::StartTls).await?;
    if response.code != codes::SERVICE_READY {
        if required {
            return Err(SmtpError::new(
                SmtpErrorKind::StarttlsNotSupported,
                format!("STARTTLS refused: {}", response),
            )
            .with_smtp_code(response.code));
        }
        tracing::warn!(response = %response, "STARTTLS refused, continuing without TLS");
        return Ok(());
    }

    transport.upgrade_tls(&config.tls, &config.host).await?;
    greet(transport, config.client_id()).await
}

/// Authenticates with PLAIN or LOGIN, whichever the server prefers to offer.
async fn authenticate(
    transport: &mut dyn SmtpTransport,
    credentials: &Credentials,
    allow_plaintext: bool,
) -> SmtpResult<()> {
    let available = transport
        .capabilities()
        .map(|c| c.auth_methods())
        .unwrap_or_default();
    let method = Authenticator::select_method(&available, transport.is_tls(), allow_plaintext)?;

    tracing::debug!(method = %method, username = credentials.username(), "Authenticating");

    let result = match method {
        AuthMethod::Plain => auth_plain(transport, credentials).await,
        AuthMethod::Login => auth_login(transport, credentials).await,
    };

    result.map_err(|e| match e.smtp_code() {
        // Any refusal during AUTH means the login failed
        Some(code)
            if (500..600).contains(&code) && e.kind() != SmtpErrorKind::CredentialsInvalid =>
        {
            SmtpError::authentication(e.message().to_string()).with_smtp_code(code)
        }
        _ => e,
    })?;

    transport.set_state(TransactionState::Authenticated);
    Ok(())
}

async fn auth_plain(
    transport: &mut dyn SmtpTransport,
    credentials: &Credentials,
) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Plain,
        initial_response: Some(Authenticator::plain_initial_response(credentials)),
    };
    transport
        .send_command(&command)
        .await?
        .expect_code(codes::AUTH_SUCCESS)?;
    Ok(())
}

async fn auth_login(
    transport: &mut dyn SmtpTransport,
    credentials: &Credentials,
) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Login,
        initial_response: None,
    };
    transport
        .send_command(&command)
        .await?
        .expect_code(codes::AUTH_CONTINUE)?;

    send_auth_line(transport, &Authenticator::login_username(credentials))
        .await?
        .expect_code(codes::AUTH_CONTINUE)?;

    send_auth_line(transport, &Authenticator::login_password(credentials))
        .await?
        .expect_code(codes::AUTH_SUCCESS)?;
    Ok(())
}

async fn send_auth_line(transport: &mut dyn SmtpTransport, line: &str) -> SmtpResult<SmtpResponse> {
    transport.send_data(format!("{}\r\n", line).as_bytes()).await?;
    transport.read_response().await
}
