//! Configuration types for the bulk mailer.
//!
//! Provides configuration with builder pattern for:
//! - Server connection settings and credentials
//! - TLS configuration
//! - Delivery log location
//! - Inter-send pacing

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delivery log file.
pub const DEFAULT_DATABASE_PATH: &str = "email_performance.db";

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS. Only for local relays and test servers.
    None,
    /// Opportunistic STARTTLS.
    #[serde(rename = "starttls")]
    StartTls,
    /// Required STARTTLS (fail if not supported).
    #[default]
    #[serde(rename = "starttls_required")]
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

impl FromStr for TlsMode {
    type Err = SmtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TlsMode::None),
            "starttls" => Ok(TlsMode::StartTls),
            "starttls_required" => Ok(TlsMode::StartTlsRequired),
            "implicit" => Ok(TlsMode::Implicit),
            other => Err(SmtpError::configuration(format!("Unknown TLS mode: {}", other))),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// PEM bundle of additional trusted CA certificates.
    pub ca_cert_path: Option<PathBuf>,
    /// Server Name Indication override.
    pub sni_override: Option<String>,
}

/// Inclusive range of whole seconds to pause between sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    /// Shortest pause in seconds.
    pub min: u64,
    /// Longest pause in seconds.
    pub max: u64,
}

impl DelayRange {
    /// Creates a validated delay range.
    pub fn new(min: u64, max: u64) -> SmtpResult<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// Checks that `min <= max`.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.min > self.max {
            return Err(SmtpError::configuration(format!(
                "Delay range minimum {} exceeds maximum {}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Draws a whole number of seconds uniformly from the range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_secs(rng.gen_range(self.min..=self.max))
    }
}

impl Default for DelayRange {
    fn default() -> Self {
        Self { min: 1, max: 5 }
    }
}

/// Bulk mailer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Sender address, used for `From` and `MAIL FROM`.
    pub sender: String,
    /// Login name. Falls back to the sender address.
    pub username: Option<String>,
    /// Login password (serialization skipped for security).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
    /// Delivery log database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Pause between sends when the caller does not pass one.
    #[serde(default)]
    pub delay: DelayRange,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }
fn default_database_path() -> PathBuf { PathBuf::from(DEFAULT_DATABASE_PATH) }

impl MailerConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> MailerConfigBuilder {
        MailerConfigBuilder::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// Reads `SMTP_HOST`, `SMTP_SENDER` and `SMTP_PASSWORD` (required) and
    /// `SMTP_PORT`, `SMTP_USERNAME`, `SMTP_TLS_MODE`, `MAILER_DB_PATH`
    /// (optional).
    pub fn from_env() -> SmtpResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> SmtpResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SmtpError::configuration(format!("{} must be set", key)))
        };

        let mut builder = Self::builder()
            .host(required("SMTP_HOST")?)
            .sender(required("SMTP_SENDER")?)
            .password(required("SMTP_PASSWORD")?);

        if let Some(port) = lookup("SMTP_PORT") {
            let port = port
                .parse()
                .map_err(|_| SmtpError::configuration(format!("Invalid SMTP_PORT: {}", port)))?;
            builder = builder.port(port);
        }
        if let Some(username) = lookup("SMTP_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(mode) = lookup("SMTP_TLS_MODE") {
            builder = builder.tls_mode(mode.parse()?);
        }
        if let Some(path) = lookup("MAILER_DB_PATH") {
            builder = builder.database_path(path);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }

        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }

        if self.sender.is_empty() {
            return Err(SmtpError::configuration("Sender address is required"));
        }

        if self.sender.chars().any(|c| c.is_control()) {
            return Err(SmtpError::configuration(
                "Sender address cannot contain control characters",
            ));
        }

        self.delay.validate()
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the login name.
    pub fn login(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.sender)
    }

    /// Returns the credentials if a password is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.password
            .as_ref()
            .map(|password| Credentials::new(self.login(), password.clone()))
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for mailer configuration.
#[derive(Debug, Default)]
pub struct MailerConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    sender: Option<String>,
    username: Option<String>,
    password: Option<SecretString>,
    tls: TlsConfig,
    connect_timeout: Duration,
    command_timeout: Duration,
    client_id: Option<String>,
    database_path: Option<PathBuf>,
    delay: DelayRange,
}

impl MailerConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the sender address.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets sender address and password in one go; the sender doubles as login.
    pub fn credentials(mut self, sender: impl Into<String>, password: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets a login name distinct from the sender.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Disables TLS (local relays and tests only).
    pub fn no_tls(mut self) -> Self {
        self.tls.mode = TlsMode::None;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the delivery log database file.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the default pause between sends.
    pub fn delay(mut self, delay: DelayRange) -> Self {
        self.delay = delay;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SmtpResult<MailerConfig> {
        let config = MailerConfig {
            host: self.host.ok_or_else(|| SmtpError::configuration("Host is required"))?,
            port: self.port.unwrap_or(DEFAULT_PORT),
            sender: self
                .sender
                .ok_or_else(|| SmtpError::configuration("Sender address is required"))?,
            username: self.username,
            password: self.password,
            tls: self.tls,
            connect_timeout: if self.connect_timeout == Duration::ZERO {
                DEFAULT_CONNECT_TIMEOUT
            } else {
                self.connect_timeout
            },
            command_timeout: if self.command_timeout == Duration::ZERO {
                DEFAULT_COMMAND_TIMEOUT
            } else {
                self.command_timeout
            },
            client_id: self.client_id,
            database_path: self.database_path.unwrap_or_else(default_database_path),
            delay: self.delay,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use secrecy::ExposeSecret;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_config_builder() {
        let config = MailerConfig::builder()
            .host("smtp.example.com")
            .port(2525)
            .credentials("news@example.com", "pass")
            .build()
            .unwrap();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 2525);
        assert_eq!(config.sender, "news@example.com");
        assert_eq!(config.login(), "news@example.com");
        assert_eq!(config.address(), "smtp.example.com:2525");
        assert!(config.password.is_some());
    }

    #[test]
    fn test_config_defaults() {
        let config = MailerConfig::builder()
            .host("smtp.example.com")
            .sender("news@example.com")
            .build()
            .unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.tls.mode, TlsMode::StartTlsRequired);
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(config.delay, DelayRange { min: 1, max: 5 });
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(MailerConfig::builder().sender("a@b.c").build().is_err());
        assert!(MailerConfig::builder().host("smtp.example.com").build().is_err());
        assert!(MailerConfig::builder()
            .host("smtp.example.com")
            .sender("evil@example.com\r\nRCPT TO:<x@y.z>")
            .build()
            .is_err());
        assert!(MailerConfig::builder()
            .host("smtp.example.com")
            .sender("a@b.c")
            .delay(DelayRange { min: 5, max: 1 })
            .build()
            .is_err());
    }

    #[test]
    fn test_username_overrides_login() {
        let config = MailerConfig::builder()
            .host("smtp.example.com")
            .credentials("news@example.com", "pass")
            .username("apikey")
            .build()
            .unwrap();

        let credentials = config.credentials().unwrap();
        assert_eq!(credentials.username(), "apikey");
        assert_eq!(credentials.password().expose_secret(), "pass");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SMTP_HOST", "smtp.gmail.com"),
            ("SMTP_PORT", "465"),
            ("SMTP_SENDER", "your_email@gmail.com"),
            ("SMTP_PASSWORD", "your_password"),
            ("SMTP_TLS_MODE", "implicit"),
            ("MAILER_DB_PATH", "/tmp/logs.db"),
        ]
        .into_iter()
        .collect();

        let config = MailerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.port, 465);
        assert_eq!(config.tls.mode, TlsMode::Implicit);
        assert_eq!(config.database_path, PathBuf::from("/tmp/logs.db"));
    }

    #[test]
    fn test_zero_port_is_rejected() {
        assert!(MailerConfig::builder()
            .host("smtp.example.com")
            .sender("a@b.c")
            .port(0)
            .build()
            .is_err());

        let err = MailerConfig::from_lookup(|k| match k {
            "SMTP_HOST" => Some("smtp.example.com".to_string()),
            "SMTP_SENDER" => Some("a@example.com".to_string()),
            "SMTP_PASSWORD" => Some("secret".to_string()),
            "SMTP_PORT" => Some("0".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn test_from_lookup_missing_password() {
        let result = MailerConfig::from_lookup(|k| match k {
            "SMTP_HOST" => Some("smtp.example.com".to_string()),
            "SMTP_SENDER" => Some("a@example.com".to_string()),
            _ => None,
        });
        let err = result.unwrap_err();
        assert!(err.message().contains("SMTP_PASSWORD"));
    }

    #[test]
    fn test_tls_mode_from_str() {
        assert_eq!("STARTTLS".parse::<TlsMode>().unwrap(), TlsMode::StartTls);
        assert_eq!("none".parse::<TlsMode>().unwrap(), TlsMode::None);
        assert!("ssl3".parse::<TlsMode>().is_err());
    }

    #[test]
    fn test_tls_mode_serde_names_match_from_str() {
        for mode in [
            TlsMode::None,
            TlsMode::StartTls,
            TlsMode::StartTlsRequired,
            TlsMode::Implicit,
        ] {
            let name = serde_json::to_value(mode).unwrap();
            let name = name.as_str().unwrap();
            assert_eq!(name.parse::<TlsMode>().unwrap(), mode);
        }
        assert_eq!(
            serde_json::from_str::<TlsMode>(r#""starttls_required""#).unwrap(),
            TlsMode::StartTlsRequired
        );
    }

    #[test]
    fn test_delay_samples_stay_in_bounds() {
        let range = DelayRange::default();
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<u64> = (0..1000).map(|_| range.sample(&mut rng).as_secs()).collect();

        assert!(samples.iter().all(|s| (1..=5).contains(s)));
        let distinct: HashSet<u64> = samples.into_iter().collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_degenerate_delay_range() {
        let range = DelayRange::new(3, 3).unwrap();
        let mut rng = rand::thread_rng();
        assert_eq!(range.sample(&mut rng), Duration::from_secs(3));
        assert!(DelayRange::new(4, 2).is_err());
    }

    #[test]
    fn test_config_deserialize() {
        let json = r#"{
            "host": "smtp.example.com",
            "sender": "news@example.com",
            "connect_timeout": "10s",
            "command_timeout": "1m",
            "tls": { "mode": "starttls" },
            "delay": { "min": 2, "max": 4 }
        }"#;
        let config: MailerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(60));
        assert_eq!(config.tls.mode, TlsMode::StartTls);
        assert_eq!(config.delay, DelayRange { min: 2, max: 4 });
        assert!(config.password.is_none());
    }
}
