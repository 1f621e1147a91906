//! Twilio-style SMS adapter: segment calculation, status callback mapping,
//! and inbound reply classification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::types::{Channel, Outcome};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterError, ChannelAdapter, ProviderReceipt, RetainedMessages};

/// Carrier limit on concatenated segments.
const MAX_SEGMENTS: u32 = 10;

/// Keywords that carriers treat as an opt-out.
const STOP_KEYWORDS: &[&str] = &["stop", "stopall", "unsubscribe", "cancel", "end", "quit"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub from_number: String,
    pub status_callback_url: Option<String>,
    /// Messages kept for lookup before the oldest is dropped.
    pub max_retained: usize,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            from_number: "+15550000000".to_string(),
            status_callback_url: None,
            max_retained: 10_000,
        }
    }
}

/// A message accepted by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    pub provider_id: String,
    pub to: String,
    pub from: String,
    pub body: String,
    pub segments: u32,
    pub created_at: DateTime<Utc>,
}

/// SMS channel adapter with a bounded in-memory message store.
pub struct SmsAdapter {
    config: SmsConfig,
    messages: RetainedMessages<SmsMessage>,
}

impl SmsAdapter {
    pub fn new(config: SmsConfig) -> Self {
        tracing::info!(from = %config.from_number, "SMS adapter initialized");
        Self {
            messages: RetainedMessages::new(config.max_retained),
            config,
        }
    }

    pub fn config(&self) -> &SmsConfig {
        &self.config
    }

    pub fn get_message(&self, provider_id: &str) -> Option<SmsMessage> {
        self.messages.get(provider_id)
    }

    pub fn retained(&self) -> usize {
        self.messages.len()
    }

    /// Maps a provider status callback to an engine outcome. `queued` and
    /// `sent` carry no new information and map to `None`.
    pub fn map_status(status: &str) -> Option<Outcome> {
        match status {
            "delivered" => Some(Outcome::Delivered),
            "failed" | "undelivered" => Some(Outcome::Bounced),
            "queued" | "sending" | "sent" => None,
            other => {
                tracing::warn!(status = %other, "Unknown SMS status in callback");
                None
            }
        }
    }

    /// An inbound message from the prospect is a reply unless it is an
    /// opt-out keyword.
    pub fn classify_inbound(body: &str) -> Outcome {
        let normalized = body.trim().to_ascii_lowercase();
        if STOP_KEYWORDS.contains(&normalized.as_str()) {
            Outcome::Unsubscribed
        } else {
            Outcome::Replied
        }
    }

    /// Number of SMS segments for a message body.
    /// GSM 7-bit: 160 chars single, 153 per part. UCS-2: 70 single, 67 per part.
    pub fn calculate_segments(body: &str) -> u32 {
        if body.is_empty() {
            return 1;
        }

        let char_count = body.chars().count() as u32;
        let (single, multi) = if body.chars().all(is_gsm_7bit) {
            (160, 153)
        } else {
            (70, 67)
        };

        if char_count <= single {
            1
        } else {
            char_count.div_ceil(multi)
        }
    }

    fn is_plausible_number(number: &str) -> bool {
        let digits = number.strip_prefix('+').unwrap_or(number);
        (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        recipient: &str,
        _subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, AdapterError> {
        if !Self::is_plausible_number(recipient) {
            return Err(AdapterError::permanent(format!(
                "invalid phone number '{}'",
                recipient
            )));
        }

        let segments = Self::calculate_segments(body);
        if segments > MAX_SEGMENTS {
            return Err(AdapterError::permanent(format!(
                "message needs {} segments, limit is {}",
                segments, MAX_SEGMENTS
            )));
        }

        let provider_id = format!("SM{}", uuid::Uuid::new_v4().simple());
        let message = SmsMessage {
            provider_id: provider_id.clone(),
            to: recipient.to_string(),
            from: self.config.from_number.clone(),
            body: body.to_string(),
            segments,
            created_at: Utc::now(),
        };

        tracing::info!(
            to = %recipient,
            provider_id = %provider_id,
            segments = segments,
            "SMS message queued"
        );
        metrics::counter!("sms.sent").increment(1);
        metrics::counter!("sms.segments").increment(u64::from(segments));

        self.messages.insert(provider_id.clone(), message);
        Ok(ProviderReceipt {
            provider_message_id: provider_id,
        })
    }
}

/// Whether a character is in the GSM 7-bit default alphabet or its extension table.
fn is_gsm_7bit(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c,
            ' ' | '!' | '"' | '#' | '$' | '%' | '&' | '\'' | '(' | ')'
            | '*' | '+' | ',' | '-' | '.' | '/' | ':' | ';' | '<' | '='
            | '>' | '?' | '@' | '_' | '\n' | '\r'
            | '{' | '}' | '[' | ']' | '~' | '\\' | '^' | '|'
            | '£' | '¥' | 'è' | 'é' | 'ù' | 'ì' | 'ò' | 'Ç' | 'Ø' | 'ø'
            | 'Å' | 'å' | 'Δ' | 'Φ' | 'Γ' | 'Λ' | 'Ω' | 'Π' | 'Ψ' | 'Σ'
            | 'Θ' | 'Ξ' | 'Æ' | 'æ' | 'ß' | 'É' | '¤' | '¡' | '¿' | 'Ä'
            | 'Ö' | 'Ñ' | 'Ü' | '§' | 'ä' | 'ö' | 'ñ' | 'ü' | 'à' | '€'
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_retrieve() {
        let adapter = SmsAdapter::new(SmsConfig::default());
        let receipt = adapter
            .send("+15559876543", None, "Hello, World!")
            .await
            .unwrap();

        let msg = adapter.get_message(&receipt.provider_message_id).unwrap();
        assert_eq!(msg.to, "+15559876543");
        assert_eq!(msg.from, "+15550000000");
        assert_eq!(msg.segments, 1);
    }

    #[tokio::test]
    async fn test_message_store_is_bounded() {
        let adapter = SmsAdapter::new(SmsConfig {
            max_retained: 3,
            ..SmsConfig::default()
        });
        let mut ids = Vec::new();
        for _ in 0..5 {
            let receipt = adapter.send("+15559876543", None, "ping").await.unwrap();
            ids.push(receipt.provider_message_id);
        }
        assert_eq!(adapter.retained(), 3);
        assert!(adapter.get_message(&ids[1]).is_none());
        assert!(adapter.get_message(&ids[4]).is_some());
    }

    #[tokio::test]
    async fn test_rejects_bad_number_permanently() {
        let adapter = SmsAdapter::new(SmsConfig::default());
        let err = adapter.send("call-me", None, "hi").await.unwrap_err();
        assert!(!err.retriable);
    }

    #[tokio::test]
    async fn test_rejects_oversized_body() {
        let adapter = SmsAdapter::new(SmsConfig::default());
        let body = "A".repeat(153 * 11);
        let err = adapter.send("+15559876543", None, &body).await.unwrap_err();
        assert!(err.message.contains("segments"));
    }

    #[test]
    fn test_calculate_segments_gsm() {
        assert_eq!(SmsAdapter::calculate_segments(""), 1);
        assert_eq!(SmsAdapter::calculate_segments(&"A".repeat(160)), 1);
        assert_eq!(SmsAdapter::calculate_segments(&"A".repeat(161)), 2);
        assert_eq!(SmsAdapter::calculate_segments(&"B".repeat(306)), 2);
        assert_eq!(SmsAdapter::calculate_segments(&"C".repeat(307)), 3);
    }

    #[test]
    fn test_calculate_segments_unicode() {
        let body = format!("{}\u{1F600}", "A".repeat(69));
        assert_eq!(SmsAdapter::calculate_segments(&body), 1);

        let body = format!("{}\u{1F600}", "A".repeat(70));
        assert_eq!(SmsAdapter::calculate_segments(&body), 2);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SmsAdapter::map_status("delivered"), Some(Outcome::Delivered));
        assert_eq!(SmsAdapter::map_status("undelivered"), Some(Outcome::Bounced));
        assert_eq!(SmsAdapter::map_status("sent"), None);
        assert_eq!(SmsAdapter::map_status("mystery"), None);
    }

    #[test]
    fn test_inbound_classification() {
        assert_eq!(SmsAdapter::classify_inbound("  STOP "), Outcome::Unsubscribed);
        assert_eq!(
            SmsAdapter::classify_inbound("Sure, let's talk Tuesday"),
            Outcome::Replied
        );
    }
}
