//! Transport layer for SMTP connections.
//!
//! Provides the [`SmtpTransport`] abstraction over a plain or TLS
//! TCP stream, and the [`TransportConnector`] seam the mailer uses to
//! open one.

use async_trait::async_trait;
use std::fmt;
use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{MailerConfig, TlsConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};

/// TLS handshake timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Sends raw data (for DATA command body).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Upgrades the connection to TLS.
    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT if the connection is still open and releases the stream.
    async fn close(&mut self) -> SmtpResult<()>;

    /// Returns the current transaction state.
    fn state(&self) -> TransactionState;

    /// Sets the transaction state.
    fn set_state(&mut self, state: TransactionState);

    /// Returns the server capabilities.
    fn capabilities(&self) -> Option<&EsmtpCapabilities>;

    /// Sets the server capabilities.
    fn set_capabilities(&mut self, caps: EsmtpCapabilities);
}

/// Opens transports for the mailer.
#[async_trait]
pub trait TransportConnector: Send + Sync + fmt::Debug {
    /// Connects to the configured server and reads its greeting.
    async fn connect(&self, config: &MailerConfig) -> SmtpResult<Box<dyn SmtpTransport>>;
}

/// Connector that opens real TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, config: &MailerConfig) -> SmtpResult<Box<dyn SmtpTransport>> {
        let transport = TcpTransport::connect(config).await?;
        Ok(Box::new(transport))
    }
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    /// Read/write stream; `None` once closed or mid-upgrade.
    stream: Option<TransportStream>,
    /// Command timeout.
    command_timeout: Duration,
    /// Transaction state.
    state: TransactionState,
    /// Server capabilities.
    capabilities: Option<EsmtpCapabilities>,
    /// TLS enabled flag.
    tls_enabled: bool,
    /// Server host.
    host: String,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Connects to an SMTP server and reads the greeting.
    ///
    /// With [`TlsMode::Implicit`] the TLS handshake happens before the
    /// greeting is read.
    pub async fn connect(config: &MailerConfig) -> SmtpResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "Connect timed out"))?
            .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        tracing::debug!(address = %address, "TCP connection established");

        let mut transport = Self {
            stream: Some(TransportStream::Plain(BufReader::new(stream))),
            command_timeout: config.command_timeout,
            state: TransactionState::Initial,
            capabilities: None,
            tls_enabled: false,
            host: config.host.clone(),
        };

        if config.tls.mode == TlsMode::Implicit {
            transport.upgrade_tls(&config.tls, &config.host).await?;
        }

        let greeting = transport.read_response().await?;
        if !greeting.is_success() {
            return Err(greeting.to_error());
        }

        transport.state = TransactionState::Connected;
        Ok(transport)
    }

    /// Maps IO errors to SMTP errors.
    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => SmtpError::new(
                SmtpErrorKind::ConnectionRefused,
                format!("Connection refused to {}", address),
            )
            .with_cause(error),
            io::ErrorKind::TimedOut => {
                SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "Connect timed out")
            }
            io::ErrorKind::ConnectionReset => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
            }
            // Name resolution failures surface as uncategorized errors
            _ if error.to_string().contains("lookup") => SmtpError::new(
                SmtpErrorKind::DnsResolution,
                format!("Could not resolve {}", address),
            )
            .with_cause(error),
            _ => SmtpError::connection(format!("Connection error: {}", error)).with_cause(error),
        }
    }

    /// Builds a rustls connector trusting the webpki roots plus any
    /// configured CA bundle.
    fn tls_connector(config: &TlsConfig) -> SmtpResult<TlsConnector> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.ca_cert_path {
            let file = File::open(path).map_err(|e| {
                SmtpError::new(
                    SmtpErrorKind::CertificateInvalid,
                    format!("Cannot open CA bundle {}", path.display()),
                )
                .with_cause(e)
            })?;
            let mut reader = io::BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    SmtpError::new(SmtpErrorKind::CertificateInvalid, "Malformed CA bundle")
                        .with_cause(e)
                })?;
                root_store.add(cert).map_err(|e| {
                    SmtpError::new(SmtpErrorKind::CertificateInvalid, "Rejected CA certificate")
                        .with_cause(e)
                })?;
            }
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(tls_config)))
    }

    /// Reads lines until we have a complete response.
    async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::timeout(SmtpErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| SmtpError::protocol(format!("Read error: {}", e)))?;

            if read == 0 {
                return Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            let line = line.trim_end().to_string();

            // "250-..." continues, "250 ..." ends the reply
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Writes data to the stream and flushes it.
    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Write error: {}", e)))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Flush error: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let line = format!("{}\r\n", command.to_smtp_string());

        tracing::debug!(command = %command, "Sending SMTP command");

        self.send_data(line.as_bytes()).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout_duration = self.command_timeout;
        match self.stream.as_mut() {
            Some(TransportStream::Plain(stream)) => {
                Self::write_all(stream.get_mut(), data, timeout_duration).await
            }
            Some(TransportStream::Tls(stream)) => {
                Self::write_all(stream.get_mut(), data, timeout_duration).await
            }
            None => Err(SmtpError::not_connected()),
        }
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let timeout_duration = self.command_timeout;
        let response = match self.stream.as_mut() {
            Some(TransportStream::Plain(stream)) => {
                Self::read_response_inner(stream, timeout_duration).await?
            }
            Some(TransportStream::Tls(stream)) => {
                Self::read_response_inner(stream, timeout_duration).await?
            }
            None => return Err(SmtpError::not_connected()),
        };

        tracing::debug!(
            code = response.code,
            message = %response.first_message(),
            "Received SMTP response"
        );

        Ok(response)
    }

    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()> {
        if self.tls_enabled {
            return Ok(());
        }

        let connector = Self::tls_connector(config)?;
        let name = config.sni_override.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(name.to_string())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", name)))?;

        let tcp_stream = match self.stream.take() {
            Some(TransportStream::Plain(reader)) => reader.into_inner(),
            Some(tls @ TransportStream::Tls(_)) => {
                self.stream = Some(tls);
                return Err(SmtpError::tls("Already using TLS"));
            }
            None => return Err(SmtpError::not_connected()),
        };

        let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| {
                SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out")
            })?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        tracing::debug!(server_name = %name, "TLS established");

        self.stream = Some(TransportStream::Tls(BufReader::new(tls_stream)));
        self.tls_enabled = true;
        self.state = TransactionState::TlsEstablished;
        // Capabilities must be re-learned over the encrypted channel
        self.capabilities = None;

        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if self.state == TransactionState::Closed || self.stream.is_none() {
            self.state = TransactionState::Closed;
            self.stream = None;
            return Ok(());
        }

        let result = self
            .send_command(&SmtpCommand::Quit)
            .await
            .and_then(|response| response.expect_success().map(|_| ()));

        match self.stream.take() {
            Some(TransportStream::Plain(mut stream)) => {
                let _ = stream.get_mut().shutdown().await;
            }
            Some(TransportStream::Tls(mut stream)) => {
                let _ = stream.get_mut().shutdown().await;
            }
            None => {}
        }
        self.state = TransactionState::Closed;

        result
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn local_config(port: u16) -> MailerConfig {
        MailerConfig::builder()
            .host("127.0.0.1")
            .port(port)
            .sender("news@example.com")
            .no_tls()
            .command_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_multiline_reply() {
        let (mut client, server) = tokio::io::duplex(256);
        client
            .write_all(b"250-mx.example.com\r\n250-SIZE 1000\r\n250 STARTTLS\r\n")
            .await
            .unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let response = TcpTransport::read_response_inner(&mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message, vec!["mx.example.com", "SIZE 1000", "STARTTLS"]);
    }

    #[tokio::test]
    async fn test_eof_is_connection_reset() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = BufReader::new(server);
        let err = TcpTransport::read_response_inner(&mut reader, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_connect_reads_greeting_and_quits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 test ESMTP\r\n").await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"221 bye\r\n").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let mut transport = TcpTransport::connect(&local_config(port)).await.unwrap();
        assert_eq!(transport.state(), TransactionState::Connected);
        assert!(!transport.is_tls());

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransactionState::Closed);
        assert_eq!(server.await.unwrap(), "QUIT\r\n");

        // Second close is a no-op
        transport.close().await.unwrap();
        let err = transport.send_command(&SmtpCommand::Noop).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_rejecting_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"554 no service\r\n").await.unwrap();
        });

        let err = TcpTransport::connect(&local_config(port)).await.unwrap_err();
        assert_eq!(err.smtp_code(), Some(554));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpTransport::connect(&local_config(port)).await.unwrap_err();
        assert!(err.kind().is_connection_failure());
    }

    #[test]
    fn test_missing_ca_bundle() {
        let config = TlsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        let err = TcpTransport::tls_connector(&config).err().unwrap();
        assert_eq!(err.kind(), SmtpErrorKind::CertificateInvalid);
    }

    #[test]
    fn test_empty_ca_bundle_is_accepted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# no certificates here").unwrap();
        let config = TlsConfig {
            ca_cert_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(TcpTransport::tls_connector(&config).is_ok());
    }
}
