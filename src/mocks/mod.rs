//! Mock implementations for testing.
//!
//! [`MockTransport`] plays a small scripted SMTP server: it answers
//! the handshake, accepts or rejects recipients and records everything
//! the client sends. Clones share the same server, so a test can keep
//! one handle and give another to the mailer through [`MockConnector`].

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::auth::AuthMethod;
use crate::config::{MailerConfig, TlsConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::{SmtpTransport, TransportConnector};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct MockServer {
    commands: Vec<SmtpCommand>,
    data: Vec<Vec<u8>>,
    /// Replies that override the simulation, consumed in order.
    queued: VecDeque<SmtpResponse>,
    /// Replies produced by raw data writes, waiting for `read_response`.
    pending: VecDeque<SmtpResponse>,
    fail_next: Option<SmtpError>,
    ehlo: bool,
    starttls: bool,
    auth_mechanisms: String,
    size_limit: Option<usize>,
    reject_auth: bool,
    rejected_recipients: HashSet<String>,
    tls: bool,
    disconnected: bool,
    closed: bool,
    awaiting_data: bool,
    login_step: u8,
    current_recipient: Option<String>,
    delivered: Vec<String>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            data: Vec::new(),
            queued: VecDeque::new(),
            pending: VecDeque::new(),
            fail_next: None,
            ehlo: true,
            starttls: true,
            auth_mechanisms: "PLAIN LOGIN".to_string(),
            size_limit: Some(10 * 1024 * 1024),
            reject_auth: false,
            rejected_recipients: HashSet::new(),
            tls: false,
            disconnected: false,
            closed: false,
            awaiting_data: false,
            login_step: 0,
            current_recipient: None,
            delivered: Vec::new(),
        }
    }
}

impl MockServer {
    fn check_link(&mut self) -> SmtpResult<()> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        if self.disconnected {
            return Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "Server closed connection",
            ));
        }
        Ok(())
    }

    fn ehlo_response(&self) -> SmtpResponse {
        let mut lines = vec!["mock.example.com greets you".to_string()];
        if let Some(size) = self.size_limit {
            lines.push(format!("SIZE {}", size));
        }
        if !self.auth_mechanisms.is_empty() {
            lines.push(format!("AUTH {}", self.auth_mechanisms));
        }
        if self.starttls && !self.tls {
            lines.push("STARTTLS".to_string());
        }
        lines.push("8BITMIME".to_string());
        lines.push("ENHANCEDSTATUSCODES".to_string());
        SmtpResponse::multiline(codes::OK, lines)
    }

    fn auth_result(&self) -> SmtpResponse {
        if self.reject_auth {
            SmtpResponse::new(codes::AUTH_FAILED, "5.7.8 Authentication credentials invalid")
        } else {
            SmtpResponse::new(codes::AUTH_SUCCESS, "2.7.0 Authentication successful")
        }
    }

    fn respond(&mut self, command: &SmtpCommand) -> SmtpResponse {
        match command {
            SmtpCommand::Ehlo(_) if self.ehlo => self.ehlo_response(),
            SmtpCommand::Ehlo(_) => {
                SmtpResponse::new(codes::NOT_IMPLEMENTED, "5.5.2 EHLO not supported")
            }
            SmtpCommand::Helo(_) => SmtpResponse::new(codes::OK, "mock.example.com"),
            SmtpCommand::StartTls if self.starttls => {
                SmtpResponse::new(codes::SERVICE_READY, "2.0.0 Ready to start TLS")
            }
            SmtpCommand::StartTls => {
                SmtpResponse::new(codes::NOT_IMPLEMENTED, "5.5.1 STARTTLS not available")
            }
            SmtpCommand::Auth {
                mechanism: AuthMethod::Plain,
                ..
            } => self.auth_result(),
            SmtpCommand::Auth {
                mechanism: AuthMethod::Login,
                ..
            } => {
                self.login_step = 1;
                SmtpResponse::new(codes::AUTH_CONTINUE, "VXNlcm5hbWU6")
            }
            SmtpCommand::MailFrom { .. } => {
                self.current_recipient = None;
                SmtpResponse::new(codes::OK, "2.1.0 Ok")
            }
            SmtpCommand::RcptTo { address } if self.rejected_recipients.contains(address) => {
                SmtpResponse::new(
                    codes::MAILBOX_UNAVAILABLE,
                    format!("5.1.1 <{}>: Recipient address rejected", address),
                )
            }
            SmtpCommand::RcptTo { address } => {
                self.current_recipient = Some(address.clone());
                SmtpResponse::new(codes::OK, "2.1.5 Ok")
            }
            SmtpCommand::Data => {
                self.awaiting_data = true;
                SmtpResponse::new(codes::START_MAIL_INPUT, "End data with <CR><LF>.<CR><LF>")
            }
            SmtpCommand::Rset => {
                self.current_recipient = None;
                self.awaiting_data = false;
                SmtpResponse::new(codes::OK, "2.0.0 Ok")
            }
            SmtpCommand::Noop => SmtpResponse::new(codes::OK, "2.0.0 Ok"),
            SmtpCommand::Quit => SmtpResponse::new(codes::SERVICE_CLOSING, "2.0.0 Bye"),
        }
    }

    fn receive_data(&mut self, data: &[u8]) {
        self.data.push(data.to_vec());

        if self.awaiting_data {
            self.awaiting_data = false;
            if let Some(recipient) = self.current_recipient.take() {
                self.delivered.push(recipient);
            }
            self.pending
                .push_back(SmtpResponse::new(codes::OK, "2.0.0 Ok: queued"));
            return;
        }

        match self.login_step {
            1 => {
                self.login_step = 2;
                self.pending
                    .push_back(SmtpResponse::new(codes::AUTH_CONTINUE, "UGFzc3dvcmQ6"));
            }
            2 => {
                self.login_step = 0;
                let result = self.auth_result();
                self.pending.push_back(result);
            }
            _ => {}
        }
    }
}

/// Mock SMTP transport for testing.
#[derive(Debug, Clone)]
pub struct MockTransport {
    server: Arc<Mutex<MockServer>>,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    tls_enabled: bool,
}

impl MockTransport {
    /// Creates a mock server that offers STARTTLS and AUTH PLAIN LOGIN
    /// and accepts every recipient.
    pub fn new() -> Self {
        Self {
            server: Arc::new(Mutex::new(MockServer::default())),
            state: TransactionState::Connected,
            capabilities: None,
            tls_enabled: false,
        }
    }

    fn configure(self, f: impl FnOnce(&mut MockServer)) -> Self {
        f(&mut lock(&self.server));
        self
    }

    /// Sets the advertised AUTH mechanisms (space separated).
    pub fn with_auth_mechanisms(self, mechanisms: &str) -> Self {
        let mechanisms = mechanisms.to_string();
        self.configure(|s| s.auth_mechanisms = mechanisms)
    }

    /// Sets the advertised SIZE limit.
    pub fn with_size_limit(self, size: usize) -> Self {
        self.configure(|s| s.size_limit = Some(size))
    }

    /// Answers EHLO with 502 so the client must fall back to HELO.
    pub fn without_ehlo(self) -> Self {
        self.configure(|s| s.ehlo = false)
    }

    /// Neither advertises nor accepts STARTTLS.
    pub fn without_starttls(self) -> Self {
        self.configure(|s| s.starttls = false)
    }

    /// Rejects every login with 535.
    pub fn rejecting_auth(self) -> Self {
        self.configure(|s| s.reject_auth = true)
    }

    /// Rejects RCPT TO for `address` with 550.
    pub fn rejecting_recipient(self, address: &str) -> Self {
        let address = address.to_string();
        self.configure(|s| {
            s.rejected_recipients.insert(address);
        })
    }

    /// Queues a reply that replaces the next simulated one.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        lock(&self.server).queued.push_back(response);
        self
    }

    /// Queues an error reply.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Makes the next transport call fail with `error`.
    pub fn fail_next_with(&self, error: SmtpError) -> &Self {
        lock(&self.server).fail_next = Some(error);
        self
    }

    /// Drops the connection; every later call fails.
    pub fn disconnect(&self) {
        lock(&self.server).disconnected = true;
    }

    /// Returns recorded commands.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        lock(&self.server).commands.clone()
    }

    /// Returns recorded commands as sent on the wire.
    pub fn commands(&self) -> Vec<String> {
        self.recorded_commands()
            .iter()
            .map(SmtpCommand::to_smtp_string)
            .collect()
    }

    /// Returns the verb of each recorded command.
    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .iter()
            .map(|c| c.split_whitespace().next().unwrap_or_default().to_string())
            .collect()
    }

    /// Returns raw data writes (AUTH LOGIN lines and message payloads).
    pub fn data(&self) -> Vec<Vec<u8>> {
        lock(&self.server).data.clone()
    }

    /// Returns the recipients whose messages were accepted, in order.
    pub fn delivered(&self) -> Vec<String> {
        lock(&self.server).delivered.clone()
    }

    /// Forgets recorded commands and data.
    pub fn clear_commands(&self) {
        let mut server = lock(&self.server);
        server.commands.clear();
        server.data.clear();
    }

    /// Returns true once the client has closed the connection.
    pub fn is_closed(&self) -> bool {
        lock(&self.server).closed
    }

    fn reply(&self, server: &mut MockServer, command: &SmtpCommand) -> SmtpResponse {
        match server.queued.pop_front() {
            Some(response) => response,
            None => server.respond(command),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let mut server = lock(&self.server);
        server.check_link()?;
        server.commands.push(command.clone());
        Ok(self.reply(&mut server, command))
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        let mut server = lock(&self.server);
        server.check_link()?;
        server.receive_data(data);
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let mut server = lock(&self.server);
        server.check_link()?;
        let pending = server.pending.pop_front();
        match server.queued.pop_front().or(pending) {
            Some(response) => Ok(response),
            None => Err(SmtpError::new(
                SmtpErrorKind::ReadTimeout,
                "No reply pending on mock server",
            )),
        }
    }

    async fn upgrade_tls(&mut self, _config: &TlsConfig, _host: &str) -> SmtpResult<()> {
        let mut server = lock(&self.server);
        server.check_link()?;
        server.tls = true;

        self.tls_enabled = true;
        self.state = TransactionState::TlsEstablished;
        self.capabilities = None;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if self.state == TransactionState::Closed {
            return Ok(());
        }
        self.state = TransactionState::Closed;

        let mut server = lock(&self.server);
        server.closed = true;
        server.check_link()?;
        server.commands.push(SmtpCommand::Quit);
        let response = self.reply(&mut server, &SmtpCommand::Quit);
        response.expect_success().map(|_| ())
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: EsmtpCapabilities) {
        self.capabilities = Some(caps);
    }
}

/// Connector handing out [`MockTransport`] connections.
#[derive(Debug, Clone)]
pub struct MockConnector {
    transport: MockTransport,
    failure: Option<(SmtpErrorKind, String)>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Connects every attempt to `transport`'s server.
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            failure: None,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails every attempt with an error of `kind`.
    pub fn failing(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            transport: MockTransport::new(),
            failure: Some((kind, message.into())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of connect attempts.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, config: &MailerConfig) -> SmtpResult<Box<dyn SmtpTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some((kind, message)) = &self.failure {
            return Err(SmtpError::new(*kind, message.clone()));
        }

        let mut transport = MockTransport {
            server: Arc::clone(&self.transport.server),
            state: TransactionState::Connected,
            capabilities: None,
            tls_enabled: false,
        };
        {
            let mut server = lock(&transport.server);
            server.closed = false;
            server.tls = false;
        }

        if config.tls.mode == TlsMode::Implicit {
            transport.upgrade_tls(&config.tls, &config.host).await?;
        }

        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_transaction() {
        let mut mock = MockTransport::new().rejecting_recipient("b@x.com");

        let ehlo = mock
            .send_command(&SmtpCommand::Ehlo("client".to_string()))
            .await
            .unwrap();
        let caps = EsmtpCapabilities::from_ehlo_response(&ehlo);
        assert!(caps.starttls);
        assert_eq!(caps.auth_mechanisms.len(), 2);

        let rejected = mock
            .send_command(&SmtpCommand::RcptTo {
                address: "b@x.com".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rejected.code, 550);

        mock.send_command(&SmtpCommand::RcptTo {
            address: "a@x.com".to_string(),
        })
        .await
        .unwrap();
        let data = mock.send_command(&SmtpCommand::Data).await.unwrap();
        assert_eq!(data.code, codes::START_MAIL_INPUT);
        mock.send_data(b"body\r\n.\r\n").await.unwrap();
        assert_eq!(mock.read_response().await.unwrap().code, codes::OK);
        assert_eq!(mock.delivered(), vec!["a@x.com"]);
    }

    #[tokio::test]
    async fn test_queued_override_and_failure() {
        let mut mock = MockTransport::new();
        mock.queue_error(421, "4.3.2 Shutting down");
        let response = mock.send_command(&SmtpCommand::Noop).await.unwrap();
        assert_eq!(response.code, 421);

        mock.fail_next_with(SmtpError::timeout(SmtpErrorKind::WriteTimeout, "stalled"));
        let err = mock.send_command(&SmtpCommand::Noop).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::WriteTimeout);

        mock.disconnect();
        let err = mock.send_command(&SmtpCommand::Noop).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_clones_share_server() {
        let handle = MockTransport::new();
        let mut conn = handle.clone();
        conn.send_command(&SmtpCommand::Noop).await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(handle.command_names(), vec!["NOOP", "QUIT"]);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_failing_connector() {
        let connector = MockConnector::failing(SmtpErrorKind::DnsResolution, "no such host");
        let config = MailerConfig::builder()
            .host("nowhere.invalid")
            .sender("a@b.c")
            .build()
            .unwrap();

        let err = connector.connect(&config).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::DnsResolution);
        assert_eq!(connector.attempts(), 1);
    }
}
