//! Social direct-message adapter (LinkedIn-style InMail / DM).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::types::Channel;
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterError, ChannelAdapter, ProviderReceipt, RetainedMessages};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialConfig {
    pub network: String,
    pub max_message_chars: usize,
    pub max_retained: usize,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            network: "linkedin".to_string(),
            max_message_chars: 1900,
            max_retained: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialMessage {
    pub message_id: String,
    pub handle: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

pub struct SocialAdapter {
    config: SocialConfig,
    messages: RetainedMessages<SocialMessage>,
}

impl SocialAdapter {
    pub fn new(config: SocialConfig) -> Self {
        tracing::info!(network = %config.network, "Social adapter initialized");
        Self {
            messages: RetainedMessages::new(config.max_retained),
            config,
        }
    }

    pub fn config(&self) -> &SocialConfig {
        &self.config
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn get_message(&self, message_id: &str) -> Option<SocialMessage> {
        self.messages.get(message_id)
    }

    /// Strips a leading `@` and rejects handles with whitespace.
    fn normalize_handle(handle: &str) -> Option<&str> {
        let handle = handle.trim().trim_start_matches('@');
        if handle.is_empty() || handle.chars().any(char::is_whitespace) {
            None
        } else {
            Some(handle)
        }
    }
}

#[async_trait]
impl ChannelAdapter for SocialAdapter {
    fn channel(&self) -> Channel {
        Channel::Social
    }

    async fn send(
        &self,
        recipient: &str,
        _subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, AdapterError> {
        let handle = Self::normalize_handle(recipient).ok_or_else(|| {
            AdapterError::permanent(format!("invalid social handle '{}'", recipient))
        })?;

        let length = body.chars().count();
        if length > self.config.max_message_chars {
            return Err(AdapterError::permanent(format!(
                "message is {} characters, {} allows {}",
                length, self.config.network, self.config.max_message_chars
            )));
        }

        let receipt = ProviderReceipt::generated(&self.config.network);
        tracing::debug!(
            handle = %handle,
            message_id = %receipt.provider_message_id,
            "Social message queued"
        );
        metrics::counter!("social.sent", "network" => self.config.network.clone()).increment(1);

        self.messages.insert(
            receipt.provider_message_id.clone(),
            SocialMessage {
                message_id: receipt.provider_message_id.clone(),
                handle: handle.to_string(),
                body: body.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_normalizes_handle() {
        let adapter = SocialAdapter::new(SocialConfig::default());
        let receipt = adapter.send("@dana-r", None, "Hi Dana").await.unwrap();
        assert!(receipt.provider_message_id.starts_with("linkedin-"));
        assert_eq!(adapter.message_count(), 1);
        let message = adapter.get_message(&receipt.provider_message_id).unwrap();
        assert_eq!(message.handle, "dana-r");
    }

    #[tokio::test]
    async fn test_rejects_long_message() {
        let adapter = SocialAdapter::new(SocialConfig {
            max_message_chars: 10,
            ..SocialConfig::default()
        });
        let err = adapter
            .send("dana", None, "this is far too long")
            .await
            .unwrap_err();
        assert!(!err.retriable);
    }

    #[tokio::test]
    async fn test_rejects_blank_handle() {
        let adapter = SocialAdapter::new(SocialConfig::default());
        assert!(adapter.send("@", None, "hi").await.is_err());
        assert!(adapter.send("two words", None, "hi").await.is_err());
    }
}
