//! Channel adapter contract and registry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::types::Channel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider acknowledgement for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
}

impl ProviderReceipt {
    pub fn generated(prefix: &str) -> Self {
        Self {
            provider_message_id: format!("{}-{}", prefix, Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
    /// Transient failures are retried by the scheduler; the rest fail the
    /// enrollment immediately.
    pub retriable: bool,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Transmits a rendered message on one channel. Later outcomes (delivered,
/// opened, ...) are reported back out of band through the outcome webhook.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, AdapterError>;
}

/// One adapter per channel.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under the channel it reports, replacing any
    /// previous adapter for that channel.
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.adapters.keys().copied().collect();
        channels.sort_by_key(|c| c.display_name());
        channels
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

/// Provider-side records of accepted messages, keyed by provider message id.
/// Holds at most `capacity` entries; the oldest is evicted first.
pub struct RetainedMessages<T> {
    capacity: usize,
    entries: DashMap<String, T>,
    order: Mutex<VecDeque<String>>,
}

impl<T: Clone> RetainedMessages<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    pub fn insert(&self, provider_message_id: String, value: T) {
        let mut order = self.order.lock();
        if self.entries.insert(provider_message_id.clone(), value).is_none() {
            order.push_back(provider_message_id);
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn get(&self, provider_message_id: &str) -> Option<T> {
        self.entries.get(provider_message_id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message accepted by a `ScriptedAdapter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Adapter whose responses are scripted up front. Used for dry runs and
/// tests; once the script is exhausted every send succeeds.
pub struct ScriptedAdapter {
    channel: Channel,
    script: Mutex<VecDeque<Result<(), AdapterError>>>,
    latency: Option<Duration>,
    sent: Mutex<Vec<SentMessage>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            latency: None,
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue the result of the next send.
    pub fn push_result(&self, result: Result<(), AdapterError>) {
        self.script.lock().push_back(result);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Highest number of sends observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<ProviderReceipt, AdapterError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.script.lock().pop_front().unwrap_or(Ok(()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        scripted?;
        self.sent.lock().push(SentMessage {
            recipient: recipient.to_string(),
            subject: subject.map(str::to_string),
            body: body.to_string(),
        });
        Ok(ProviderReceipt::generated(self.channel.display_name()))
    }
}
