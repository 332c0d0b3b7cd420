//! Bulk mailer command-line driver.
//!
//! Sends one campaign file through the server configured in the
//! environment:
//!
//! ```text
//! SMTP_HOST=smtp.example.com SMTP_SENDER=news@example.com SMTP_PASSWORD=... \
//!     bulk-mailer campaign.json
//! ```
//!
//! `RUST_LOG` overrides the log filter and `MAILER_LOG_FORMAT` selects
//! `pretty`, `json` or `compact` output.

use std::process::ExitCode;

use bulk_mailer::{
    BulkMailer, Campaign, DeliveryLogStore, DeliveryStatus, LogFormat, LoggingConfig, MailerConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    let format = std::env::var("MAILER_LOG_FORMAT")
        .ok()
        .and_then(|value| value.parse::<LogFormat>().ok())
        .unwrap_or_default();
    if let Err(e) = LoggingConfig::new().with_format(format).init() {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let campaign_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: bulk-mailer <campaign.json>");
            return ExitCode::FAILURE;
        }
    };

    match run(&campaign_path).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the server could not be reached.
async fn run(campaign_path: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let config = MailerConfig::from_env()?;
    let campaign = Campaign::from_json_file(campaign_path)?;
    let store = DeliveryLogStore::open(&config.database_path)?;

    let mut mailer = BulkMailer::new(config, store);

    if mailer.connect().await.is_err() {
        mailer.close().await;
        return Ok(false);
    }

    let result = mailer.send_campaign(&campaign).await;
    let metrics = mailer.metrics();
    mailer.close().await;
    let report = result?;

    println!(
        "Sent {} of {} emails ({} failed) in {}",
        report.succeeded,
        report.total,
        report.failed,
        humantime::format_duration(std::time::Duration::from_secs(report.duration.as_secs()))
    );
    println!(
        "Connections: {} attempted, {} failed; pause total {}s",
        metrics.connection_attempts,
        metrics.connections_failed,
        metrics.total_delay.as_secs()
    );

    // Reopen to report the cumulative log across runs.
    let log = DeliveryLogStore::open(&mailer.config().database_path)?;
    println!(
        "Delivery log: {} entries ({} successful, {} failed)",
        log.count()?,
        log.count_by_status(DeliveryStatus::Success)?,
        log.count_by_status(DeliveryStatus::Failed)?
    );
    log.close()?;

    Ok(true)
}
