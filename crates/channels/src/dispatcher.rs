//! Delivery dispatcher: renders a due step for its prospect, hands it to the
//! channel adapter, and reports exactly one terminal `DeliveryEvent`
//! (`sent` or `failed`) per attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use outreach_core::directory::ProspectDirectory;
use outreach_core::error::OutreachError;
use outreach_core::types::{Channel, DeliveryEvent, Enrollment, Outcome, Prospect, Step};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::AdapterRegistry;
use crate::personalization::TemplateRenderer;

/// How a single dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent { provider_message_id: String },
    /// The prospect has no address for the step's channel.
    NoContactMethod,
    MissingVariable { variable: String },
    AdapterFailed { message: String, retriable: bool },
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Terminal event for this attempt: `sent` or `failed`.
    pub event: DeliveryEvent,
    pub status: DispatchStatus,
    pub latency_ms: u64,
}

impl DispatchReport {
    /// Outcome the step's branch conditions are evaluated against.
    pub fn branch_outcome(&self) -> Outcome {
        match self.status {
            DispatchStatus::Sent { .. } => Outcome::Sent,
            DispatchStatus::NoContactMethod => Outcome::NoContactMethod,
            _ => Outcome::Failed,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self.status, DispatchStatus::Sent { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Correlation {
    enrollment_id: Uuid,
    step_id: Uuid,
    sent_at: DateTime<Utc>,
}

/// Routes due steps to the adapter registered for their channel.
pub struct DeliveryDispatcher {
    adapters: AdapterRegistry,
    directory: Arc<dyn ProspectDirectory>,
    renderer: TemplateRenderer,
    send_timeout: Duration,
    /// Keyed by provider message id, for callbacks that only carry the
    /// provider's id. Entries older than `correlation_retention` are pruned.
    correlations: DashMap<String, Correlation>,
    correlation_retention: chrono::Duration,
    next_prune_at: Mutex<DateTime<Utc>>,
}

impl DeliveryDispatcher {
    pub fn new(
        adapters: AdapterRegistry,
        directory: Arc<dyn ProspectDirectory>,
        renderer: TemplateRenderer,
        send_timeout: Duration,
    ) -> Self {
        info!(
            channels = ?adapters.channels(),
            send_timeout_ms = send_timeout.as_millis() as u64,
            "Delivery dispatcher initialized"
        );
        Self {
            adapters,
            directory,
            renderer,
            send_timeout,
            correlations: DashMap::new(),
            correlation_retention: chrono::Duration::days(30),
            next_prune_at: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// How long provider message ids stay resolvable after the send.
    pub fn with_correlation_retention(mut self, retention: chrono::Duration) -> Self {
        self.correlation_retention = retention;
        self
    }

    pub fn directory(&self) -> &Arc<dyn ProspectDirectory> {
        &self.directory
    }

    /// Looks up the enrollment and step a provider message belongs to.
    pub fn correlate(&self, provider_message_id: &str) -> Option<(Uuid, Uuid)> {
        self.correlations
            .get(provider_message_id)
            .map(|c| (c.enrollment_id, c.step_id))
    }

    /// Provider message ids issued for an enrollment's sends.
    pub fn correlations_for(&self, enrollment_id: &Uuid) -> Vec<String> {
        self.correlations
            .iter()
            .filter(|c| c.value().enrollment_id == *enrollment_id)
            .map(|c| c.key().clone())
            .collect()
    }

    /// Drops correlations for sends older than the retention window. Runs at
    /// most once an hour of `now`; returns how many entries were removed.
    pub fn prune_correlations(&self, now: DateTime<Utc>) -> usize {
        {
            let mut next = self.next_prune_at.lock();
            if now < *next {
                return 0;
            }
            *next = now + chrono::Duration::hours(1);
        }
        let cutoff = now - self.correlation_retention;
        let before = self.correlations.len();
        self.correlations.retain(|_, c| c.sent_at > cutoff);
        let pruned = before.saturating_sub(self.correlations.len());
        if pruned > 0 {
            debug!(pruned, retained = self.correlations.len(), "Pruned provider correlations");
        }
        pruned
    }

    /// Attempts delivery of `step` for `enrollment`. Never fails: every
    /// problem is folded into the report's `failed` event.
    pub async fn dispatch(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let start = Instant::now();
        metrics::counter!("dispatch.attempts", "channel" => step.channel.display_name())
            .increment(1);

        let status = self.attempt(enrollment, step).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let outcome = match status {
            DispatchStatus::Sent { .. } => Outcome::Sent,
            _ => Outcome::Failed,
        };
        let event = DeliveryEvent::new(enrollment, step, outcome, now);

        match &status {
            DispatchStatus::Sent {
                provider_message_id,
            } => {
                self.correlations.insert(
                    provider_message_id.clone(),
                    Correlation {
                        enrollment_id: enrollment.id,
                        step_id: step.id,
                        sent_at: now,
                    },
                );
                metrics::counter!("dispatch.sent", "channel" => step.channel.display_name())
                    .increment(1);
                metrics::histogram!("dispatch.latency_ms", "channel" => step.channel.display_name())
                    .record(latency_ms as f64);
                debug!(
                    enrollment_id = %enrollment.id,
                    step_id = %step.id,
                    provider_message_id = %provider_message_id,
                    "Step sent"
                );
            }
            other => {
                metrics::counter!("dispatch.failed", "channel" => step.channel.display_name())
                    .increment(1);
                warn!(
                    enrollment_id = %enrollment.id,
                    step_id = %step.id,
                    status = ?other,
                    "Step not sent"
                );
            }
        }

        DispatchReport {
            event,
            status,
            latency_ms,
        }
    }

    async fn attempt(&self, enrollment: &Enrollment, step: &Step) -> DispatchStatus {
        let Some(prospect) = self.directory.get_prospect(&enrollment.prospect_id) else {
            return DispatchStatus::AdapterFailed {
                message: format!("prospect {} not in directory", enrollment.prospect_id),
                retriable: false,
            };
        };

        let Some(recipient) = recipient_for(step.channel, &prospect) else {
            return DispatchStatus::NoContactMethod;
        };

        let rendered = match self.renderer.render(step, &prospect) {
            Ok(rendered) => rendered,
            Err(OutreachError::MissingVariable { variable }) => {
                return DispatchStatus::MissingVariable { variable };
            }
            Err(e) => {
                return DispatchStatus::AdapterFailed {
                    message: e.to_string(),
                    retriable: false,
                };
            }
        };

        let Some(adapter) = self.adapters.get(step.channel) else {
            return DispatchStatus::AdapterFailed {
                message: format!("no adapter registered for {}", step.channel.display_name()),
                retriable: false,
            };
        };

        let subject = match step.channel {
            Channel::Email => rendered.subject.as_deref(),
            _ => None,
        };

        match tokio::time::timeout(
            self.send_timeout,
            adapter.send(recipient, subject, &rendered.body),
        )
        .await
        {
            Ok(Ok(receipt)) => DispatchStatus::Sent {
                provider_message_id: receipt.provider_message_id,
            },
            Ok(Err(e)) => DispatchStatus::AdapterFailed {
                message: e.message,
                retriable: e.retriable,
            },
            Err(_) => DispatchStatus::AdapterFailed {
                message: format!(
                    "{} adapter timed out after {}ms",
                    step.channel.display_name(),
                    self.send_timeout.as_millis()
                ),
                retriable: true,
            },
        }
    }
}

/// Address for `channel`, or `None` when the prospect has none.
pub fn recipient_for(channel: Channel, prospect: &Prospect) -> Option<&str> {
    let address = match channel {
        Channel::Email => Some(prospect.email.as_str()),
        Channel::Sms => prospect.phone.as_deref(),
        Channel::Social => prospect.social_handle.as_deref(),
    }?;
    let address = address.trim();
    (!address.is_empty()).then_some(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, ScriptedAdapter};
    use outreach_core::directory::InMemoryDirectory;
    use std::collections::HashMap;

    fn prospect() -> Prospect {
        Prospect {
            id: "p-1".into(),
            first_name: "Dana".into(),
            company_name: "Acme".into(),
            industry: "Logistics".into(),
            recent_news: "Series B".into(),
            email: "dana@acme.io".into(),
            phone: None,
            social_handle: Some("@dana".into()),
        }
    }

    fn dispatcher(adapter: Arc<ScriptedAdapter>, timeout: Duration) -> DeliveryDispatcher {
        let directory = Arc::new(InMemoryDirectory::with_prospects([prospect()]));
        DeliveryDispatcher::new(
            AdapterRegistry::new().with_adapter(adapter),
            directory,
            TemplateRenderer::new("Sam", HashMap::new()),
            timeout,
        )
    }

    fn enrollment() -> Enrollment {
        Enrollment::new(Uuid::new_v4(), "p-1", Utc::now())
    }

    #[tokio::test]
    async fn test_sent_records_sent_event_and_correlation() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email));
        let dispatcher = dispatcher(adapter.clone(), Duration::from_secs(5));
        let enrollment = enrollment();
        let step =
            Step::new(Channel::Email, "Hi {{first_name}}").with_subject("For {{company_name}}");
        let now = Utc::now();

        let report = dispatcher.dispatch(&enrollment, &step, now).await;

        assert!(report.is_sent());
        assert_eq!(report.event.outcome, Outcome::Sent);
        assert_eq!(report.event.occurred_at, now);
        assert_eq!(report.event.step_id, step.id);

        let sent = adapter.sent();
        assert_eq!(sent[0].recipient, "dana@acme.io");
        assert_eq!(sent[0].subject.as_deref(), Some("For Acme"));
        assert_eq!(sent[0].body, "Hi Dana");

        let DispatchStatus::Sent { provider_message_id } = &report.status else {
            panic!("expected sent");
        };
        assert_eq!(
            dispatcher.correlate(provider_message_id),
            Some((enrollment.id, step.id))
        );
    }

    #[tokio::test]
    async fn test_correlations_expire_after_retention() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email));
        let dispatcher = dispatcher(adapter, Duration::from_secs(5))
            .with_correlation_retention(chrono::Duration::days(30));
        let enrollment = enrollment();
        let step = Step::new(Channel::Email, "Hi");
        let sent_at = Utc::now();
        dispatcher.dispatch(&enrollment, &step, sent_at).await;
        let ids = dispatcher.correlations_for(&enrollment.id);
        assert_eq!(ids.len(), 1);

        assert_eq!(dispatcher.prune_correlations(sent_at + chrono::Duration::days(29)), 0);
        assert_eq!(
            dispatcher.correlate(&ids[0]),
            Some((enrollment.id, step.id))
        );

        // Within the hour of the last prune nothing is scanned.
        let just_after = sent_at + chrono::Duration::days(29) + chrono::Duration::minutes(30);
        assert_eq!(dispatcher.prune_correlations(just_after), 0);

        assert_eq!(dispatcher.prune_correlations(sent_at + chrono::Duration::days(31)), 1);
        assert_eq!(dispatcher.correlate(&ids[0]), None);
    }

    #[tokio::test]
    async fn test_missing_phone_is_no_contact_method() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Sms));
        let dispatcher = dispatcher(adapter.clone(), Duration::from_secs(5));
        let step = Step::new(Channel::Sms, "Hi");

        let report = dispatcher.dispatch(&enrollment(), &step, Utc::now()).await;

        assert_eq!(report.status, DispatchStatus::NoContactMethod);
        assert_eq!(report.branch_outcome(), Outcome::NoContactMethod);
        assert_eq!(report.event.outcome, Outcome::Failed);
        assert_eq!(adapter.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_variable_never_reaches_adapter() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Social));
        let dispatcher = dispatcher(adapter.clone(), Duration::from_secs(5));
        let step = Step::new(Channel::Social, "Hey {{nickname}}");

        let report = dispatcher.dispatch(&enrollment(), &step, Utc::now()).await;

        assert_eq!(
            report.status,
            DispatchStatus::MissingVariable {
                variable: "nickname".into()
            }
        );
        assert_eq!(report.event.outcome, Outcome::Failed);
        assert_eq!(adapter.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_adapter_error_keeps_retriable_flag() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email));
        adapter.push_result(Err(AdapterError::transient("503 from provider")));
        let dispatcher = dispatcher(adapter, Duration::from_secs(5));
        let step = Step::new(Channel::Email, "Hi");

        let report = dispatcher.dispatch(&enrollment(), &step, Utc::now()).await;
        assert_eq!(
            report.status,
            DispatchStatus::AdapterFailed {
                message: "503 from provider".into(),
                retriable: true
            }
        );
    }

    #[tokio::test]
    async fn test_slow_adapter_times_out_as_retriable() {
        let adapter = Arc::new(
            ScriptedAdapter::new(Channel::Email).with_latency(Duration::from_millis(200)),
        );
        let dispatcher = dispatcher(adapter, Duration::from_millis(10));
        let step = Step::new(Channel::Email, "Hi");

        let report = dispatcher.dispatch(&enrollment(), &step, Utc::now()).await;
        assert!(matches!(
            report.status,
            DispatchStatus::AdapterFailed { retriable: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_unregistered_channel_fails_permanently() {
        let adapter = Arc::new(ScriptedAdapter::new(Channel::Email));
        let dispatcher = dispatcher(adapter, Duration::from_secs(5));
        let step = Step::new(Channel::Social, "Hi");

        let report = dispatcher.dispatch(&enrollment(), &step, Utc::now()).await;
        assert!(matches!(
            report.status,
            DispatchStatus::AdapterFailed { retriable: false, .. }
        ));
    }

    #[test]
    fn test_recipient_for_blank_address() {
        let mut p = prospect();
        p.phone = Some("   ".into());
        assert_eq!(recipient_for(Channel::Sms, &p), None);
        assert_eq!(recipient_for(Channel::Social, &p), Some("@dana"));
    }
}
