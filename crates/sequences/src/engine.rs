use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outreach_channels::adapter::AdapterRegistry;
use outreach_channels::dispatcher::DeliveryDispatcher;
use outreach_channels::personalization::TemplateRenderer;
use outreach_core::config::AppConfig;
use outreach_core::directory::ProspectDirectory;
use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::EventSink;
use outreach_core::store::{EnrollmentStore, EventLog, InMemoryStore, SequenceStore};
use outreach_core::types::{
    BranchTarget, Channel, Delay, DeliveryEvent, EngineEvent, EngineEventType, Enrollment,
    Outcome, Sequence, SequenceStatus, Step,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::definition::SequenceRegistry;
use crate::scheduler::Scheduler;

/// A century; keeps `chrono::Duration::hours` in range.
const MAX_RETENTION_HOURS: u64 = 24 * 365 * 100;

/// Storage backends the engine runs on.
#[derive(Clone)]
pub struct EngineStores {
    pub sequences: Arc<dyn SequenceStore>,
    pub enrollments: Arc<dyn EnrollmentStore>,
    pub events: Arc<dyn EventLog>,
}

impl EngineStores {
    /// All three stores backed by one `InMemoryStore`.
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            sequences: store.clone(),
            enrollments: store.clone(),
            events: store,
        }
    }
}

/// Facade over sequence definitions, enrollments, the scheduler, and the
/// delivery event log.
#[derive(Clone)]
pub struct SequenceEngine {
    registry: SequenceRegistry,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<DeliveryDispatcher>,
    stores: EngineStores,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("sequences", &self.stores.sequences.list_sequences().len())
            .field("enrollments", &self.stores.enrollments.list_enrollments().len())
            .field("events", &self.stores.events.len())
            .finish()
    }
}

impl SequenceEngine {
    pub fn new(
        config: &AppConfig,
        stores: EngineStores,
        directory: Arc<dyn ProspectDirectory>,
        adapters: AdapterRegistry,
        event_sink: Arc<dyn EventSink>,
    ) -> Self {
        let renderer = TemplateRenderer::new(
            config.dispatch.sender_name.clone(),
            config.dispatch.variable_defaults.clone(),
        );
        // Adapter calls are bounded by the lease they run under.
        let retention_hours = config.dispatch.correlation_retention_hours.min(MAX_RETENTION_HOURS);
        let dispatcher = Arc::new(
            DeliveryDispatcher::new(
                adapters,
                directory,
                renderer,
                Duration::from_secs(config.scheduler.lease_timeout_secs.max(1)),
            )
            .with_correlation_retention(chrono::Duration::hours(retention_hours as i64)),
        );
        let scheduler = Arc::new(
            Scheduler::new(
                config.scheduler.clone(),
                stores.sequences.clone(),
                stores.enrollments.clone(),
                stores.events.clone(),
                dispatcher.clone(),
            )
            .with_missing_variable_policy(config.dispatch.missing_variable_policy)
            .with_exit_outcomes(config.dispatch.exit_outcomes.clone())
            .with_event_sink(event_sink.clone()),
        );
        let registry = SequenceRegistry::new(stores.sequences.clone(), stores.enrollments.clone())
            .with_event_sink(event_sink.clone());

        info!(
            node_id = %config.node_id,
            missing_variable_policy = ?config.dispatch.missing_variable_policy,
            exit_outcomes = ?config.dispatch.exit_outcomes,
            "Sequence engine initialized"
        );

        Self {
            registry,
            scheduler,
            dispatcher,
            stores,
            event_sink,
        }
    }

    /// In-memory engine with no event sink.
    pub fn in_memory(
        config: &AppConfig,
        directory: Arc<dyn ProspectDirectory>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self::new(
            config,
            EngineStores::in_memory(),
            directory,
            adapters,
            outreach_core::event_bus::noop_sink(),
        )
    }

    pub fn registry(&self) -> &SequenceRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<DeliveryDispatcher> {
        &self.dispatcher
    }

    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    // ─── Definitions ────────────────────────────────────────────────────────

    pub fn create_sequence(
        &self,
        name: &str,
        campaign_id: Option<String>,
    ) -> OutreachResult<Sequence> {
        self.registry.create_sequence(name, campaign_id)
    }

    pub fn get_sequence(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.registry.get_sequence(id)
    }

    pub fn list_sequences(&self) -> Vec<Sequence> {
        self.registry.list_sequences()
    }

    pub fn set_campaign(&self, id: &Uuid, campaign_id: Option<String>) -> OutreachResult<Sequence> {
        self.registry.set_campaign(id, campaign_id)
    }

    pub fn add_step(
        &self,
        id: &Uuid,
        step: Step,
        position: Option<usize>,
    ) -> OutreachResult<Sequence> {
        self.registry.add_step(id, step, position)
    }

    pub fn update_step(&self, id: &Uuid, step: Step) -> OutreachResult<Sequence> {
        self.registry.update_step(id, step)
    }

    pub fn remove_step(&self, id: &Uuid, step_id: &Uuid) -> OutreachResult<Sequence> {
        self.registry.remove_step(id, step_id)
    }

    pub fn activate(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.registry.activate(id)
    }

    pub fn pause(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.registry.pause(id)
    }

    pub fn resume(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.registry.resume(id)
    }

    /// Archives the sequence and exits its unfinished enrollments.
    pub fn archive(&self, id: &Uuid) -> OutreachResult<Sequence> {
        let archived = self.registry.archive(id)?;
        let exited = self.scheduler.exit_enrollments(id)?;
        if exited > 0 {
            info!(sequence_id = %id, exited, "Exited enrollments of archived sequence");
        }
        Ok(archived)
    }

    pub fn duplicate(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.registry.duplicate(id)
    }

    pub fn delete_sequence(&self, id: &Uuid) -> OutreachResult<()> {
        self.registry.delete(id)
    }

    // ─── Enrollments ────────────────────────────────────────────────────────

    /// Enrolls a prospect. The first step becomes due at `now`.
    pub fn enroll(
        &self,
        prospect_id: &str,
        sequence_id: &Uuid,
        now: DateTime<Utc>,
    ) -> OutreachResult<Enrollment> {
        let sequence = self.registry.get_sequence(sequence_id)?;
        if !matches!(sequence.status, SequenceStatus::Active | SequenceStatus::Paused) {
            return Err(OutreachError::InvalidState(format!(
                "cannot enroll into a {:?} sequence",
                sequence.status
            )));
        }
        if self.dispatcher.directory().get_prospect(prospect_id).is_none() {
            return Err(OutreachError::NotFound(format!("prospect {}", prospect_id)));
        }

        let enrollment = Enrollment::new(*sequence_id, prospect_id, now);
        self.stores.enrollments.insert_enrollment(enrollment.clone())?;

        info!(
            enrollment_id = %enrollment.id,
            sequence_id = %sequence_id,
            prospect_id = %prospect_id,
            "Prospect enrolled"
        );
        metrics::counter!("enrollment.created").increment(1);
        self.event_sink.emit(EngineEvent::enrollment(
            EngineEventType::EnrollmentCreated,
            &enrollment,
        ));
        Ok(enrollment)
    }

    pub fn get_enrollment(&self, id: &Uuid) -> OutreachResult<Enrollment> {
        self.stores
            .enrollments
            .get_enrollment(id)
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {}", id)))
    }

    pub fn enrollments_for_sequence(&self, sequence_id: &Uuid) -> OutreachResult<Vec<Enrollment>> {
        self.registry.get_sequence(sequence_id)?;
        Ok(self.stores.enrollments.enrollments_for_sequence(sequence_id))
    }

    pub fn list_enrollments(&self) -> Vec<Enrollment> {
        self.stores.enrollments.list_enrollments()
    }

    // ─── Outcomes & events ──────────────────────────────────────────────────

    pub fn record_outcome(
        &self,
        enrollment_id: &Uuid,
        step_id: &Uuid,
        outcome: Outcome,
        occurred_at: DateTime<Utc>,
    ) -> OutreachResult<Enrollment> {
        self.scheduler
            .record_outcome(enrollment_id, step_id, outcome, occurred_at)
    }

    /// Records an outcome reported against a provider message id.
    pub fn record_provider_outcome(
        &self,
        provider_message_id: &str,
        outcome: Outcome,
        occurred_at: DateTime<Utc>,
    ) -> OutreachResult<Enrollment> {
        let (enrollment_id, step_id) = self
            .dispatcher
            .correlate(provider_message_id)
            .ok_or_else(|| {
                OutreachError::NotFound(format!("provider message {}", provider_message_id))
            })?;
        self.record_outcome(&enrollment_id, &step_id, outcome, occurred_at)
    }

    /// Consistent copy of the delivery event log.
    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.stores.events.snapshot()
    }

    pub fn events_for_sequence(&self, sequence_id: &Uuid) -> Vec<DeliveryEvent> {
        self.stores.events.events_for_sequence(sequence_id)
    }

    // ─── Scheduling ─────────────────────────────────────────────────────────

    pub fn run_pass(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        self.scheduler.run_pass(now)
    }

    pub async fn run_pass_to_completion(&self, now: DateTime<Utc>) -> usize {
        self.scheduler.run_pass_to_completion(now).await
    }

    /// Spawns the scheduler loop on the current runtime.
    pub fn spawn_scheduler(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(scheduler.run(shutdown))
    }

    /// Loads the three sample sequences shown on a fresh dashboard: one
    /// active, one paused, one draft.
    pub fn seed_demo_sequences(&self) -> OutreachResult<Vec<Sequence>> {
        let saas = self.create_sequence("SaaS Decision Makers", Some("saas-q3".into()))?;
        let breakup = Step::new(
            Channel::Email,
            "Hi {{first_name}}, I'll close the loop here. If {{company_name}} revisits this, \
             I'm a reply away. - {{sender_name}}",
        )
        .with_subject("Closing the loop")
        .with_delay(Delay::days(4));
        let intro = Step::new(
            Channel::Email,
            "Hi {{first_name}},\n\nI noticed {{company_name}} is growing rapidly in the \
             {{industry}} space...\n\n{{sender_name}}",
        )
        .with_subject("Introduction to {{company_name}}")
        .with_branch(Outcome::Replied, BranchTarget::Stop);
        let connect = Step::new(
            Channel::Social,
            "Hi {{first_name}}, enjoyed reading about {{company_name}}. Would love to connect.",
        )
        .with_delay(Delay::days(3))
        .with_branch(Outcome::NoContactMethod, BranchTarget::Step(breakup.id));
        let nudge = Step::new(
            Channel::Sms,
            "Hi {{first_name}}, following up on my email about helping {{company_name}}. \
             Quick 15-min chat this week? - {{sender_name}}",
        )
        .with_delay(Delay::days(2));
        for step in [intro, connect, nudge, breakup] {
            self.add_step(&saas.id, step, None)?;
        }
        self.activate(&saas.id)?;

        let enterprise = self.create_sequence("Enterprise Follow-up", Some("enterprise".into()))?;
        for step in [
            Step::new(
                Channel::Email,
                "Hi {{first_name}}, following up on our conversation about {{company_name}}.",
            )
            .with_subject("Following up"),
            Step::new(
                Channel::Sms,
                "Hi {{first_name}}, any thoughts on my note? - {{sender_name}}",
            )
            .with_delay(Delay::days(3)),
            Step::new(
                Channel::Email,
                "Congrats on {{recent_news}}. Happy to share how peers in {{industry}} \
                 approached it.",
            )
            .with_subject("Re: {{company_name}}")
            .with_delay(Delay::days(5)),
        ] {
            self.add_step(&enterprise.id, step, None)?;
        }
        self.activate(&enterprise.id)?;
        self.pause(&enterprise.id)?;

        let cold = self.create_sequence("Cold Outreach Template", None)?;
        for step in [
            Step::new(
                Channel::Email,
                "Hi {{first_name}}, quick question about {{company_name}}'s growth strategy.",
            )
            .with_subject("Quick question about {{company_name}}"),
            Step::new(Channel::Social, "Hi {{first_name}}, sent you a note last week.")
                .with_delay(Delay::days(2)),
            Step::new(Channel::Email, "Bumping this to the top of your inbox.")
                .with_subject("Re: Quick question")
                .with_delay(Delay::days(3)),
            Step::new(Channel::Sms, "Hi {{first_name}}, worth a 15-min chat? - {{sender_name}}")
                .with_delay(Delay::hours(36)),
            Step::new(Channel::Email, "Last note from me. Best of luck at {{company_name}}.")
                .with_subject("Should I close your file?")
                .with_delay(Delay::days(5)),
        ] {
            self.add_step(&cold.id, step, None)?;
        }

        let seeded = vec![
            self.get_sequence(&saas.id)?,
            self.get_sequence(&enterprise.id)?,
            self.get_sequence(&cold.id)?,
        ];
        info!(sequences = seeded.len(), "Seeded demo sequences");
        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use outreach_channels::adapter::ScriptedAdapter;
    use outreach_core::directory::InMemoryDirectory;
    use outreach_core::event_bus::recording_sink;
    use outreach_core::types::{EnrollmentStatus, Prospect};

    fn engine_with_sink(sink: Arc<dyn EventSink>) -> (SequenceEngine, Arc<ScriptedAdapter>) {
        let email = Arc::new(ScriptedAdapter::new(Channel::Email));
        let directory = Arc::new(InMemoryDirectory::with_prospects([Prospect {
            id: "p-1".into(),
            first_name: "Dana".into(),
            company_name: "Acme".into(),
            industry: "Logistics".into(),
            recent_news: "Series B".into(),
            email: "dana@acme.io".into(),
            phone: None,
            social_handle: None,
        }]));
        let engine = SequenceEngine::new(
            &AppConfig::default(),
            EngineStores::in_memory(),
            directory,
            AdapterRegistry::new().with_adapter(email.clone()),
            sink,
        );
        (engine, email)
    }

    fn single_step(engine: &SequenceEngine) -> Sequence {
        let seq = engine.create_sequence("Enterprise Follow-up", None).unwrap();
        engine
            .add_step(&seq.id, Step::new(Channel::Email, "Hi {{first_name}}"), None)
            .unwrap()
    }

    #[test]
    fn test_enroll_rules() {
        let sink = recording_sink();
        let (engine, _) = engine_with_sink(sink.clone());
        let seq = single_step(&engine);
        let now = Utc::now();

        assert!(matches!(
            engine.enroll("p-1", &seq.id, now),
            Err(OutreachError::InvalidState(_))
        ));
        engine.activate(&seq.id).unwrap();
        assert!(matches!(
            engine.enroll("ghost", &seq.id, now),
            Err(OutreachError::NotFound(_))
        ));

        let enrollment = engine.enroll("p-1", &seq.id, now).unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Pending);
        assert_eq!(enrollment.current_step_index, 0);
        assert_eq!(enrollment.next_run_at, now);
        assert!(matches!(
            engine.enroll("p-1", &seq.id, now),
            Err(OutreachError::InvalidState(_))
        ));
        assert_eq!(sink.count_of(EngineEventType::EnrollmentCreated), 1);

        engine.pause(&seq.id).unwrap();
        let copy = engine.duplicate(&seq.id).unwrap();
        assert!(matches!(
            engine.enroll("p-1", &copy.id, now),
            Err(OutreachError::InvalidState(_))
        ));
        // Paused sequences still accept enrollments.
        engine.activate(&copy.id).unwrap();
        engine.pause(&copy.id).unwrap();
        assert!(engine.enroll("p-1", &copy.id, now).is_ok());
    }

    #[tokio::test]
    async fn test_single_step_enrollment_lifecycle_trail() {
        let sink = recording_sink();
        let (engine, email) = engine_with_sink(sink.clone());
        let seq = single_step(&engine);
        engine.activate(&seq.id).unwrap();
        let now = Utc::now();
        let enrollment = engine.enroll("p-1", &seq.id, now).unwrap();

        assert_eq!(engine.run_pass_to_completion(now).await, 1);
        assert_eq!(email.sent_count(), 1);
        assert_eq!(
            sink.trail(&enrollment.id),
            vec![
                EngineEventType::EnrollmentCreated,
                EngineEventType::StepDispatched,
                EngineEventType::EnrollmentCompleted,
            ]
        );
        let dispatched = sink
            .recorded()
            .into_iter()
            .find(|e| e.event_type == EngineEventType::StepDispatched)
            .unwrap();
        assert_eq!(dispatched.step_id, Some(seq.steps[0].id));
        assert_eq!(dispatched.prospect_id.as_deref(), Some("p-1"));
    }

    #[tokio::test]
    async fn test_archive_exits_open_enrollments() {
        let (engine, email) = engine_with_sink(outreach_core::event_bus::noop_sink());
        let seq = single_step(&engine);
        engine.activate(&seq.id).unwrap();
        let enrollment = engine.enroll("p-1", &seq.id, Utc::now()).unwrap();
        engine.pause(&seq.id).unwrap();
        engine.archive(&seq.id).unwrap();

        let e = engine.get_enrollment(&enrollment.id).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Exited);
        assert_eq!(engine.run_pass_to_completion(Utc::now()).await, 0);
        assert_eq!(email.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_outcome_correlates_to_enrollment() {
        let (engine, _) = engine_with_sink(outreach_core::event_bus::noop_sink());
        let seq = single_step(&engine);
        engine.activate(&seq.id).unwrap();
        let now = Utc::now();
        let enrollment = engine.enroll("p-1", &seq.id, now).unwrap();
        engine.run_pass_to_completion(now).await;

        let sent = engine.events();
        assert_eq!(sent.len(), 1);
        let provider_id = engine
            .dispatcher()
            .correlations_for(&enrollment.id)
            .pop()
            .unwrap();
        engine
            .record_provider_outcome(&provider_id, Outcome::Opened, now + ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(engine.events_for_sequence(&seq.id).len(), 2);
        assert!(matches!(
            engine.record_provider_outcome("unknown", Outcome::Opened, now),
            Err(OutreachError::NotFound(_))
        ));
    }

    #[test]
    fn test_seed_demo_sequences() {
        let (engine, _) = engine_with_sink(outreach_core::event_bus::noop_sink());
        let seeded = engine.seed_demo_sequences().unwrap();
        let statuses: Vec<_> = seeded
            .iter()
            .map(|s| (s.name.as_str(), s.status, s.steps.len()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("SaaS Decision Makers", SequenceStatus::Active, 4),
                ("Enterprise Follow-up", SequenceStatus::Paused, 3),
                ("Cold Outreach Template", SequenceStatus::Draft, 5),
            ]
        );
        assert_eq!(engine.list_sequences().len(), 3);
    }
}
