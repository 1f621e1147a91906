//! SendGrid-style email adapter with webhook event mapping.
//!
//! Sends build the provider payload and queue it in a bounded outbox. Every
//! payload carries its provider message id in `custom_args`, which the
//! provider echoes on each webhook event; inbound events (delivered, open,
//! click, bounce, unsubscribe) are mapped to engine outcomes through it.

use async_trait::async_trait;
use outreach_core::types::{Channel, Outcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterError, ChannelAdapter, ProviderReceipt, RetainedMessages};

/// Custom arg that carries the provider message id through the provider.
pub const MESSAGE_ID_ARG: &str = "outreach_message_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub from_email: String,
    pub from_name: String,
    pub open_tracking: bool,
    pub click_tracking: bool,
    /// Payloads kept in the outbox before the oldest is dropped.
    pub max_retained: usize,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_email: "outreach@example.com".to_string(),
            from_name: "Outreach".to_string(),
            open_tracking: true,
            click_tracking: true,
            max_retained: 10_000,
        }
    }
}

/// Event names posted by the provider's event webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Processed,
    Deferred,
    Delivered,
    Open,
    Click,
    Bounce,
    Dropped,
    SpamReport,
    Unsubscribe,
    GroupUnsubscribe,
}

impl EmailEventType {
    /// Engine outcome for this provider event, if it maps to one.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Delivered => Some(Outcome::Delivered),
            Self::Open => Some(Outcome::Opened),
            Self::Click => Some(Outcome::Clicked),
            Self::Bounce | Self::Dropped => Some(Outcome::Bounced),
            Self::SpamReport | Self::Unsubscribe | Self::GroupUnsubscribe => {
                Some(Outcome::Unsubscribed)
            }
            Self::Processed | Self::Deferred => None,
        }
    }
}

/// One entry of the provider's webhook batch. Custom args come back as
/// top-level fields, so `outreach_message_id` is set on events for messages
/// this adapter sent. Callers that know the engine ids may pass them instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailWebhookEvent {
    pub email: String,
    pub event: EmailEventType,
    pub timestamp: i64,
    #[serde(default)]
    pub outreach_message_id: Option<String>,
    #[serde(default)]
    pub enrollment_id: Option<Uuid>,
    #[serde(default)]
    pub step_id: Option<Uuid>,
}

/// What a webhook event points back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailCorrelation {
    Step { enrollment_id: Uuid, step_id: Uuid },
    ProviderMessage(String),
}

/// Email channel adapter.
pub struct EmailAdapter {
    config: EmailConfig,
    outbox: RetainedMessages<serde_json::Value>,
}

impl EmailAdapter {
    pub fn new(config: EmailConfig) -> Self {
        info!(
            from = %config.from_email,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "Email adapter initialized"
        );
        Self {
            outbox: RetainedMessages::new(config.max_retained),
            config,
        }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn payload(&self, provider_message_id: &str) -> Option<serde_json::Value> {
        self.outbox.get(provider_message_id)
    }

    /// Maps a webhook entry to an outcome and what it belongs to. Explicit
    /// engine ids win over the echoed message id.
    pub fn map_webhook(&self, event: &EmailWebhookEvent) -> Option<(EmailCorrelation, Outcome)> {
        let correlation = match (event.enrollment_id, event.step_id, &event.outreach_message_id) {
            (Some(enrollment_id), Some(step_id), _) => EmailCorrelation::Step {
                enrollment_id,
                step_id,
            },
            (_, _, Some(message_id)) => EmailCorrelation::ProviderMessage(message_id.clone()),
            _ => {
                warn!(email = %event.email, "Email webhook event carries no correlation, skipping");
                return None;
            }
        };
        let outcome = event.event.outcome()?;

        metrics::counter!("email.webhook_events", "outcome" => outcome.as_str()).increment(1);
        debug!(
            correlation = ?correlation,
            outcome = outcome.as_str(),
            "Mapped email webhook event"
        );
        Some((correlation, outcome))
    }

    fn is_plausible_address(address: &str) -> bool {
        match address.split_once('@') {
            Some((local, domain)) => !local.is_empty() && domain.contains('.'),
            None => false,
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, AdapterError> {
        if !Self::is_plausible_address(recipient) {
            metrics::counter!("email.rejected").increment(1);
            return Err(AdapterError::permanent(format!(
                "invalid email address '{}'",
                recipient
            )));
        }

        debug!(to = %recipient, subject = ?subject, "Sending email");

        let receipt = ProviderReceipt::generated("sg");
        let payload = serde_json::json!({
            "personalizations": [{ "to": [{ "email": recipient }] }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name
            },
            "subject": subject.unwrap_or_default(),
            "content": [{ "type": "text/plain", "value": body }],
            "tracking_settings": {
                "click_tracking": { "enable": self.config.click_tracking },
                "open_tracking": { "enable": self.config.open_tracking }
            },
            "custom_args": { MESSAGE_ID_ARG: receipt.provider_message_id }
        });

        self.outbox
            .insert(receipt.provider_message_id.clone(), payload);
        metrics::counter!("email.sent").increment(1);

        Ok(receipt)
    }
}
