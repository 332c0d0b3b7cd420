//! Campaign definitions loaded by the driver binary.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DelayRange;
use crate::errors::{MailerError, MailerResult};

/// One message sent to a list of recipients.
///
/// ```json
/// {
///   "subject": "Monthly update",
///   "body": "Hello!",
///   "recipients": ["a@example.com", "b@example.com"],
///   "delay": { "min": 1, "max": 5 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Recipients, sent to in order.
    pub recipients: Vec<String>,
    /// Pause between sends; the mailer's configured range when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayRange>,
}

impl Campaign {
    /// Reads and validates a campaign file.
    pub fn from_json_file(path: impl AsRef<Path>) -> MailerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MailerError::Configuration(format!("cannot read campaign {}: {}", path.display(), e))
        })?;
        text.parse()
    }

    /// Checks that there is someone to send to and the delay range is sane.
    pub fn validate(&self) -> MailerResult<()> {
        if self.recipients.is_empty() {
            return Err(MailerError::Configuration(
                "campaign has no recipients".to_string(),
            ));
        }
        if let Some(delay) = &self.delay {
            delay
                .validate()
                .map_err(|e| MailerError::Configuration(e.message().to_string()))?;
        }
        Ok(())
    }
}

impl FromStr for Campaign {
    type Err = MailerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let campaign: Campaign = serde_json::from_str(s)
            .map_err(|e| MailerError::Configuration(format!("invalid campaign: {}", e)))?;
        campaign.validate()?;
        Ok(campaign)
    }
}
