//! Observability for the bulk mailer.
//!
//! Delivery counters for a mailer instance, and the `tracing`
//! subscriber setup used by the driver binary.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mailer metrics collector.
#[derive(Debug, Default)]
pub struct MailerMetrics {
    /// Messages accepted by the server.
    pub emails_sent: AtomicU64,
    /// Messages that failed.
    pub emails_failed: AtomicU64,
    /// Total connection attempts.
    pub connection_attempts: AtomicU64,
    /// Successful connections.
    pub connections_successful: AtomicU64,
    /// Failed connections.
    pub connections_failed: AtomicU64,
    /// Milliseconds spent pausing between sends.
    pub delay_millis: AtomicU64,
}

impl MailerMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful send.
    pub fn record_send_success(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed send.
    pub fn record_send_failure(&self) {
        self.emails_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection attempt.
    pub fn record_connection_attempt(&self, success: bool) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.connections_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a pacing pause.
    pub fn record_delay(&self, delay: Duration) {
        self.delay_millis
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_successful: self.connections_successful.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            total_delay: Duration::from_millis(self.delay_millis.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Messages accepted by the server.
    pub emails_sent: u64,
    /// Messages that failed.
    pub emails_failed: u64,
    /// Total connection attempts.
    pub connection_attempts: u64,
    /// Successful connections.
    pub connections_successful: u64,
    /// Failed connections.
    pub connections_failed: u64,
    /// Time spent pausing between sends.
    pub total_delay: Duration,
}

impl MetricsSnapshot {
    /// Returns the send success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.emails_sent + self.emails_failed;
        if total == 0 {
            1.0
        } else {
            self.emails_sent as f64 / total as f64
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace-level logging (most verbose).
    Trace,
    /// Debug-level logging.
    Debug,
    /// Info-level logging.
    Info,
    /// Warning-level logging.
    Warn,
    /// Error-level logging.
    Error,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable format with colors.
    #[default]
    Pretty,
    /// JSON format, one object per line.
    Json,
    /// Compact single-line format.
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set.
    pub level: LogLevel,
    /// The output format for log messages.
    pub format: LogFormat,
    /// Whether to include the module target in log output.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_target: false,
        }
    }
}

impl LoggingConfig {
    /// Creates a new logging configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets whether to include the module target.
    pub fn with_target(mut self, include: bool) -> Self {
        self.include_target = include;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.directive()))
    }

    /// Installs the global subscriber. Call once at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn init(self) -> Result<(), Box<dyn std::error::Error>> {
        let filter = self.filter();

        match self.format {
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_target(self.include_target))
                    .try_init()?;
            }
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init()?;
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact().with_target(self.include_target))
                    .try_init()?;
            }
        }

        Ok(())
    }
}
