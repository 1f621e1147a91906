//! Scheduler: selects due enrollments, leases them, and hands their current
//! step to the delivery dispatcher on a bounded pool of tokio tasks.
//!
//! An enrollment is only dispatched while its lease is held, so a prospect
//! never has two sends for the same enrollment in flight. The enrollment
//! record is advanced before its lease is released.
//!
//! A lease whose task is still queued for a permit or still sending is never
//! taken over, however old it is. Only leases left behind by a task that
//! died expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use outreach_channels::dispatcher::{DeliveryDispatcher, DispatchReport, DispatchStatus};
use outreach_core::config::{MissingVariablePolicy, SchedulerConfig};
use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::EventSink;
use outreach_core::store::{EnrollmentStore, EventLog, SequenceStore};
use outreach_core::types::{
    BranchTarget, DeliveryEvent, EngineEvent, EngineEventType, Enrollment, EnrollmentStatus,
    Outcome, Sequence, SequenceStatus, Step,
};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::branching::{next_run_at, Advance, BranchEvaluator};
use crate::state_machine::EnrollmentStateMachine;

/// Exclusive right to dispatch the current step of one enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn new(enrollment_id: Uuid, step_id: Uuid, now: DateTime<Utc>, timeout_secs: u64) -> Self {
        Self {
            lease_id: Uuid::new_v4(),
            enrollment_id,
            step_id,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(timeout_secs as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Marks a lease as backed by a running dispatch task until dropped. The
/// drop also runs when the task panics, which makes the lease expirable.
struct LiveLease {
    live: Arc<DashSet<Uuid>>,
    lease_id: Uuid,
}

impl LiveLease {
    fn mark(live: &Arc<DashSet<Uuid>>, lease_id: Uuid) -> Self {
        live.insert(lease_id);
        Self {
            live: Arc::clone(live),
            lease_id,
        }
    }
}

impl Drop for LiveLease {
    fn drop(&mut self) {
        self.live.remove(&self.lease_id);
    }
}

enum LeaseAcquire {
    Acquired(Lease),
    /// A previous holder let its lease lapse. Carries the new lease.
    TookOver { stale: Lease, lease: Lease },
    Held,
}

/// What a recorded dispatch did to its enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Advance(Advance),
    Retry { attempt: u32, backoff_secs: u64 },
    Fail,
    /// The enrollment reached a terminal state while the dispatch was in flight.
    Ignored,
}

/// Drives enrollments through their sequences.
pub struct Scheduler {
    config: SchedulerConfig,
    missing_variable_policy: MissingVariablePolicy,
    exit_outcomes: Vec<Outcome>,
    sequences: Arc<dyn SequenceStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    events: Arc<dyn EventLog>,
    dispatcher: Arc<DeliveryDispatcher>,
    leases: DashMap<Uuid, Lease>,
    /// Lease ids with a dispatch task still alive.
    live: Arc<DashSet<Uuid>>,
    permits: Arc<Semaphore>,
    evaluator: BranchEvaluator,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("leases", &self.leases.len())
            .field("live_dispatches", &self.live.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        sequences: Arc<dyn SequenceStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        events: Arc<dyn EventLog>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1)));
        Self {
            config,
            missing_variable_policy: MissingVariablePolicy::Skip,
            exit_outcomes: vec![Outcome::Unsubscribed],
            sequences,
            enrollments,
            events,
            dispatcher,
            leases: DashMap::new(),
            live: Arc::new(DashSet::new()),
            permits,
            evaluator: BranchEvaluator::new(),
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    pub fn with_missing_variable_policy(mut self, policy: MissingVariablePolicy) -> Self {
        self.missing_variable_policy = policy;
        self
    }

    /// Outcomes that exit an enrollment whenever they are reported.
    pub fn with_exit_outcomes(mut self, outcomes: Vec<Outcome>) -> Self {
        self.exit_outcomes = outcomes;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn active_leases(&self) -> Vec<Lease> {
        self.leases.iter().map(|l| l.value().clone()).collect()
    }

    pub fn lease_for(&self, enrollment_id: &Uuid) -> Option<Lease> {
        self.leases.get(enrollment_id).map(|l| l.clone())
    }

    /// Run the scan loop until the shutdown flag flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(poll_interval);
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            max_concurrent_dispatches = self.config.max_concurrent_dispatches,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Dispatch tasks run detached; the next tick does not wait on them.
                    let handles = self.run_pass(Utc::now());
                    if !handles.is_empty() {
                        debug!(dispatches = handles.len(), "Scheduler pass spawned dispatches");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// One selection pass at `now`. Spawns a dispatch task for every due
    /// enrollment whose lease could be acquired.
    pub fn run_pass(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        self.dispatcher.prune_correlations(now);
        let due = self.enrollments.due_enrollments(now);
        metrics::gauge!("scheduler.due_enrollments").set(due.len() as f64);

        let mut handles = Vec::new();
        for candidate in due {
            match self.prepare(&candidate, now) {
                Ok(Some((enrollment, step, lease))) => {
                    handles.push(self.spawn_dispatch(enrollment, step, lease, now));
                }
                Ok(None) => {}
                Err(e) => {
                    error!(enrollment_id = %candidate.id, error = %e, "Failed to prepare dispatch");
                }
            }
        }
        handles
    }

    /// Runs a pass and waits for every dispatch it started.
    pub async fn run_pass_to_completion(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let handles = self.run_pass(now);
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch task panicked");
            }
        }
        count
    }

    /// Leases `candidate` and re-reads it. Returns the fresh enrollment and
    /// the step to dispatch, or `None` when it should be skipped this pass.
    fn prepare(
        &self,
        candidate: &Enrollment,
        now: DateTime<Utc>,
    ) -> OutreachResult<Option<(Enrollment, Step, Lease)>> {
        let Some(sequence) = self.sequences.get_sequence(&candidate.sequence_id) else {
            warn!(
                enrollment_id = %candidate.id,
                sequence_id = %candidate.sequence_id,
                "Enrollment references a missing sequence"
            );
            return Ok(None);
        };
        if sequence.status != SequenceStatus::Active {
            return Ok(None);
        }
        let Some(step) = sequence.steps.get(candidate.current_step_index).cloned() else {
            self.complete_exhausted(candidate.id, &sequence)?;
            return Ok(None);
        };

        let lease = match self.try_acquire(candidate.id, step.id, now) {
            LeaseAcquire::Held => return Ok(None),
            LeaseAcquire::Acquired(lease) => lease,
            LeaseAcquire::TookOver { stale, lease } => {
                if !self.charge_expired_lease(&stale, &sequence, now)? {
                    self.release(&lease);
                    return Ok(None);
                }
                lease
            }
        };

        // Another pass may have advanced the enrollment since `due` was read.
        let fresh = match self.enrollments.get_enrollment(&candidate.id) {
            Some(e) if e.status.is_schedulable() && e.next_run_at <= now => e,
            _ => {
                self.release(&lease);
                return Ok(None);
            }
        };
        let step = match sequence.steps.get(fresh.current_step_index) {
            Some(step) => step.clone(),
            None => {
                self.release(&lease);
                self.complete_exhausted(fresh.id, &sequence)?;
                return Ok(None);
            }
        };
        let lease = if step.id == lease.step_id {
            lease
        } else {
            let mut lease = lease;
            lease.step_id = step.id;
            self.leases.insert(fresh.id, lease.clone());
            lease
        };

        Ok(Some((fresh, step, lease)))
    }

    fn try_acquire(&self, enrollment_id: Uuid, step_id: Uuid, now: DateTime<Utc>) -> LeaseAcquire {
        let lease = Lease::new(enrollment_id, step_id, now, self.config.lease_timeout_secs);
        match self.leases.entry(enrollment_id) {
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
                LeaseAcquire::Acquired(lease)
            }
            Entry::Occupied(mut held) => {
                let current = held.get();
                if !current.is_expired(now) || self.live.contains(&current.lease_id) {
                    return LeaseAcquire::Held;
                }
                let stale = held.insert(lease.clone());
                LeaseAcquire::TookOver { stale, lease }
            }
        }
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.leases
            .get(&lease.enrollment_id)
            .map(|held| held.lease_id == lease.lease_id)
            .unwrap_or(false)
    }

    fn release(&self, lease: &Lease) {
        self.leases
            .remove_if(&lease.enrollment_id, |_, held| held.lease_id == lease.lease_id);
    }

    /// Counts an abandoned dispatch as an attempt. Returns `false` when the
    /// enrollment ran out of attempts and was failed.
    fn charge_expired_lease(
        &self,
        stale: &Lease,
        sequence: &Sequence,
        now: DateTime<Utc>,
    ) -> OutreachResult<bool> {
        warn!(
            enrollment_id = %stale.enrollment_id,
            lease_id = %stale.lease_id,
            acquired_at = %stale.acquired_at,
            "Dispatch lease expired"
        );
        metrics::counter!("scheduler.leases_expired").increment(1);
        let max_attempts = self.config.max_attempts;
        let mut failed_event = None;
        let updated = self.enrollments.update_enrollment(&stale.enrollment_id, &mut |e| {
            if e.status.is_terminal() {
                return Ok(());
            }
            e.attempts += 1;
            e.last_error = Some(OutreachError::LeaseExpired(e.id).to_string());
            e.updated_at = Utc::now();
            if e.attempts >= max_attempts {
                let mut machine = EnrollmentStateMachine::new(e.status);
                machine.transition(EnrollmentStatus::Failed)?;
                if let Some(step) = sequence.steps.get(e.current_step_index) {
                    let event = DeliveryEvent::new(e, step, Outcome::Failed, now);
                    e.history.push(event.clone());
                    failed_event = Some(event);
                }
                e.status = machine.state;
            }
            Ok(())
        })?;
        self.event_sink.emit(
            EngineEvent::enrollment(EngineEventType::LeaseExpired, &updated).at_step(stale.step_id),
        );

        if updated.status == EnrollmentStatus::Failed {
            if let Some(event) = failed_event {
                self.events.append(event);
            }
            self.enrollment_finished(&updated, EngineEventType::EnrollmentFailed);
            return Ok(false);
        }
        Ok(!updated.status.is_terminal())
    }

    fn complete_exhausted(&self, enrollment_id: Uuid, sequence: &Sequence) -> OutreachResult<()> {
        let updated = self.enrollments.update_enrollment(&enrollment_id, &mut |e| {
            let mut machine = EnrollmentStateMachine::new(e.status);
            machine.transition(EnrollmentStatus::Completed)?;
            e.status = machine.state;
            e.updated_at = Utc::now();
            Ok(())
        })?;
        debug!(
            enrollment_id = %enrollment_id,
            steps = sequence.steps.len(),
            "Enrollment has no step left"
        );
        self.enrollment_finished(&updated, EngineEventType::EnrollmentCompleted);
        Ok(())
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        enrollment: Enrollment,
        step: Step,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let live = LiveLease::mark(&self.live, lease.lease_id);
        tokio::spawn(async move {
            let _live = live;
            let _permit = match scheduler.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Dispatch pool closed");
                    scheduler.release(&lease);
                    return;
                }
            };

            // The lease may have changed hands while this task waited for the pool.
            if !scheduler.holds(&lease) {
                warn!(
                    enrollment_id = %lease.enrollment_id,
                    lease_id = %lease.lease_id,
                    "Lease superseded before dispatch, step not sent"
                );
                metrics::counter!("scheduler.superseded_before_dispatch").increment(1);
                return;
            }

            let report = scheduler.dispatcher.dispatch(&enrollment, &step, now).await;
            if let Err(e) = scheduler.complete_dispatch(&lease, &step, report) {
                match e {
                    OutreachError::LeaseExpired(_) => {}
                    other => {
                        error!(
                            enrollment_id = %enrollment.id,
                            error = %other,
                            "Failed to record dispatch"
                        )
                    }
                }
            }
        })
    }

    /// Records a dispatch result and advances the enrollment. The event is
    /// always appended; only the current lease holder may advance.
    pub fn complete_dispatch(
        &self,
        lease: &Lease,
        step: &Step,
        report: DispatchReport,
    ) -> OutreachResult<Enrollment> {
        self.events.append(report.event.clone());

        if !self.holds(lease) {
            warn!(
                enrollment_id = %lease.enrollment_id,
                lease_id = %lease.lease_id,
                "Dispatch finished after its lease was superseded"
            );
            metrics::counter!("scheduler.stale_completions").increment(1);
            return Err(OutreachError::LeaseExpired(lease.enrollment_id));
        }

        let result = self.advance_after_dispatch(lease, step, &report);
        self.release(lease);
        let (updated, disposition) = result?;

        let emit = |event_type| {
            self.event_sink
                .emit(EngineEvent::enrollment(event_type, &updated).at_step(step.id))
        };

        match &report.status {
            DispatchStatus::Sent { .. } => emit(EngineEventType::StepDispatched),
            DispatchStatus::NoContactMethod => emit(EngineEventType::StepSkipped),
            DispatchStatus::MissingVariable { .. }
                if self.missing_variable_policy == MissingVariablePolicy::Skip =>
            {
                emit(EngineEventType::StepSkipped)
            }
            _ => emit(EngineEventType::StepFailed),
        }

        match disposition {
            Disposition::Advance(Advance::Step(index)) => {
                info!(
                    enrollment_id = %updated.id,
                    next_step_index = index,
                    next_run_at = %updated.next_run_at,
                    "Enrollment advanced"
                );
            }
            Disposition::Advance(Advance::Complete) => {
                self.enrollment_finished(&updated, EngineEventType::EnrollmentCompleted)
            }
            Disposition::Advance(Advance::Exit) => {
                self.enrollment_finished(&updated, EngineEventType::EnrollmentExited)
            }
            Disposition::Retry {
                attempt,
                backoff_secs,
            } => {
                warn!(
                    enrollment_id = %updated.id,
                    step_id = %step.id,
                    attempt,
                    backoff_secs,
                    "Retriable dispatch failure, retry scheduled"
                );
                metrics::counter!("scheduler.retries").increment(1);
            }
            Disposition::Fail => {
                self.enrollment_finished(&updated, EngineEventType::EnrollmentFailed)
            }
            Disposition::Ignored => {
                debug!(
                    enrollment_id = %updated.id,
                    status = ?updated.status,
                    "Dispatch recorded for finished enrollment"
                );
            }
        }

        Ok(updated)
    }

    fn advance_after_dispatch(
        &self,
        lease: &Lease,
        step: &Step,
        report: &DispatchReport,
    ) -> OutreachResult<(Enrollment, Disposition)> {
        let sequence = self
            .sequences
            .get_sequence(&report.event.sequence_id)
            .ok_or_else(|| {
                OutreachError::NotFound(format!("sequence {}", report.event.sequence_id))
            })?;

        let at = report.event.occurred_at;
        let policy = self.missing_variable_policy;
        let config = &self.config;
        let evaluator = &self.evaluator;
        let mut disposition = Disposition::Ignored;

        let updated = self.enrollments.update_enrollment(&lease.enrollment_id, &mut |e| {
            disposition = Disposition::Ignored;
            if e.status.is_terminal() {
                return Ok(());
            }
            let index = sequence.step_index(&step.id).unwrap_or(e.current_step_index);
            let outcome = report.branch_outcome();

            disposition = match &report.status {
                DispatchStatus::Sent { .. } => {
                    e.history.push(report.event.clone());
                    e.last_dispatch = Some((step.id, at));
                    e.last_error = None;
                    Disposition::Advance(evaluator.resolve_next(&sequence, index, outcome))
                }
                DispatchStatus::NoContactMethod => {
                    e.history.push(report.event.clone());
                    e.last_error = Some(format!(
                        "no {} address for prospect",
                        step.channel.display_name()
                    ));
                    Disposition::Advance(evaluator.resolve_next(&sequence, index, outcome))
                }
                DispatchStatus::MissingVariable { variable } => {
                    e.history.push(report.event.clone());
                    e.last_error = Some(
                        OutreachError::MissingVariable {
                            variable: variable.clone(),
                        }
                        .to_string(),
                    );
                    match policy {
                        MissingVariablePolicy::Skip => {
                            Disposition::Advance(evaluator.resolve_next(&sequence, index, outcome))
                        }
                        MissingVariablePolicy::Block => Disposition::Fail,
                    }
                }
                DispatchStatus::AdapterFailed { message, retriable } => {
                    let attempt = e.attempts + 1;
                    e.attempts = attempt;
                    e.last_error = Some(
                        OutreachError::AdapterFailure {
                            channel: step.channel,
                            message: message.clone(),
                            retriable: *retriable,
                        }
                        .to_string(),
                    );
                    if *retriable && attempt < config.max_attempts {
                        Disposition::Retry {
                            attempt,
                            backoff_secs: config.backoff_secs(attempt),
                        }
                    } else {
                        e.history.push(report.event.clone());
                        Disposition::Fail
                    }
                }
            };

            let mut machine = EnrollmentStateMachine::new(e.status);
            match disposition {
                Disposition::Advance(Advance::Step(next)) => {
                    machine.transition(EnrollmentStatus::InProgress)?;
                    e.current_step_index = next;
                    e.next_run_at = next_run_at(&sequence, next, at);
                    e.attempts = 0;
                }
                Disposition::Advance(Advance::Complete) => {
                    machine.transition(EnrollmentStatus::Completed)?;
                    e.attempts = 0;
                }
                Disposition::Advance(Advance::Exit) => {
                    machine.transition(EnrollmentStatus::Exited)?;
                    e.attempts = 0;
                }
                Disposition::Retry { backoff_secs, .. } => {
                    machine.transition(EnrollmentStatus::InProgress)?;
                    e.next_run_at = at + chrono::Duration::seconds(backoff_secs as i64);
                }
                Disposition::Fail => machine.transition(EnrollmentStatus::Failed)?,
                Disposition::Ignored => {}
            }
            e.status = machine.state;
            e.updated_at = Utc::now();
            Ok(())
        })?;

        Ok((updated, disposition))
    }

    /// Applies a downstream outcome (opened, replied, ...) reported by a
    /// channel adapter. The event is always logged; exit outcomes end the
    /// enrollment, and outcomes for the most recently dispatched step may
    /// re-target the step that follows it.
    pub fn record_outcome(
        &self,
        enrollment_id: &Uuid,
        step_id: &Uuid,
        outcome: Outcome,
        occurred_at: DateTime<Utc>,
    ) -> OutreachResult<Enrollment> {
        if !outcome.is_downstream() {
            return Err(OutreachError::Validation(format!(
                "{} is not a downstream outcome",
                outcome.as_str()
            )));
        }
        let enrollment = self
            .enrollments
            .get_enrollment(enrollment_id)
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {}", enrollment_id)))?;
        let sequence = self
            .sequences
            .get_sequence(&enrollment.sequence_id)
            .ok_or_else(|| {
                OutreachError::NotFound(format!("sequence {}", enrollment.sequence_id))
            })?;
        let step = sequence.step(step_id).ok_or_else(|| {
            OutreachError::Validation(format!(
                "step {} does not belong to sequence {}",
                step_id, sequence.id
            ))
        })?;

        self.events
            .append(DeliveryEvent::new(&enrollment, step, outcome, occurred_at));
        metrics::counter!("outcomes.recorded", "outcome" => outcome.as_str()).increment(1);
        debug!(
            enrollment_id = %enrollment_id,
            step_id = %step_id,
            outcome = outcome.as_str(),
            "Outcome recorded"
        );

        if enrollment.status.is_terminal() {
            return Ok(enrollment);
        }

        if self.exit_outcomes.contains(&outcome) {
            let updated = self.enrollments.update_enrollment(enrollment_id, &mut |e| {
                if e.status.is_terminal() {
                    return Ok(());
                }
                let mut machine = EnrollmentStateMachine::new(e.status);
                machine.transition(EnrollmentStatus::Exited)?;
                e.status = machine.state;
                e.updated_at = Utc::now();
                Ok(())
            })?;
            if updated.status == EnrollmentStatus::Exited {
                info!(
                    enrollment_id = %enrollment_id,
                    outcome = outcome.as_str(),
                    "Enrollment exited on outcome"
                );
                self.enrollment_finished(&updated, EngineEventType::EnrollmentExited);
            }
            return Ok(updated);
        }

        let Some(target) = self.evaluator.evaluate(&step.branch_conditions, outcome) else {
            return Ok(enrollment);
        };

        // Hold the lease while re-targeting so no dispatch of the old next
        // step can start underneath us.
        let lease = match self.try_acquire(*enrollment_id, *step_id, Utc::now()) {
            LeaseAcquire::Acquired(lease) => lease,
            LeaseAcquire::TookOver { lease, .. } => lease,
            LeaseAcquire::Held => {
                debug!(
                    enrollment_id = %enrollment_id,
                    "Dispatch in flight, outcome not re-targeted"
                );
                return Ok(enrollment);
            }
        };

        let step_index = sequence.step_index(step_id);
        let mut retargeted = None;
        let result = self.enrollments.update_enrollment(enrollment_id, &mut |e| {
            retargeted = None;
            let last_is_step = e
                .history
                .last()
                .map(|last| last.step_id == *step_id && last.outcome == Outcome::Sent)
                .unwrap_or(false);
            if e.status.is_terminal() || e.attempts > 0 || !last_is_step {
                return Ok(());
            }
            let Some(index) = step_index else {
                return Ok(());
            };

            let mut machine = EnrollmentStateMachine::new(e.status);
            match target {
                BranchTarget::Stop => {
                    machine.transition(EnrollmentStatus::Exited)?;
                    retargeted = Some(Advance::Exit);
                }
                BranchTarget::Step(target_id) => {
                    let Some(target_index) = sequence.step_index(&target_id) else {
                        return Ok(());
                    };
                    if target_index <= index || target_index == e.current_step_index {
                        return Ok(());
                    }
                    let anchor = e.last_dispatch.map(|(_, at)| at).unwrap_or(occurred_at);
                    e.current_step_index = target_index;
                    e.next_run_at = next_run_at(&sequence, target_index, anchor);
                    retargeted = Some(Advance::Step(target_index));
                }
            }
            e.status = machine.state;
            e.updated_at = Utc::now();
            Ok(())
        });
        self.release(&lease);
        let updated = result?;

        match retargeted {
            Some(Advance::Exit) => {
                info!(
                    enrollment_id = %enrollment_id,
                    outcome = outcome.as_str(),
                    "Branch on outcome stopped enrollment"
                );
                self.enrollment_finished(&updated, EngineEventType::EnrollmentExited);
            }
            Some(Advance::Step(index)) => {
                info!(
                    enrollment_id = %enrollment_id,
                    outcome = outcome.as_str(),
                    next_step_index = index,
                    next_run_at = %updated.next_run_at,
                    "Branch on outcome re-targeted enrollment"
                );
            }
            _ => {}
        }
        Ok(updated)
    }

    /// Exits every non-terminal enrollment of `sequence_id`.
    pub fn exit_enrollments(&self, sequence_id: &Uuid) -> OutreachResult<usize> {
        let mut exited = 0;
        for enrollment in self.enrollments.enrollments_for_sequence(sequence_id) {
            if enrollment.status.is_terminal() {
                continue;
            }
            let updated = self.enrollments.update_enrollment(&enrollment.id, &mut |e| {
                if e.status.is_terminal() {
                    return Ok(());
                }
                let mut machine = EnrollmentStateMachine::new(e.status);
                machine.transition(EnrollmentStatus::Exited)?;
                e.status = machine.state;
                e.updated_at = Utc::now();
                Ok(())
            })?;
            if updated.status == EnrollmentStatus::Exited {
                exited += 1;
                self.enrollment_finished(&updated, EngineEventType::EnrollmentExited);
            }
        }
        Ok(exited)
    }

    fn enrollment_finished(&self, enrollment: &Enrollment, event_type: EngineEventType) {
        let status = match enrollment.status {
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
            EnrollmentStatus::Failed => "failed",
            _ => "other",
        };
        metrics::counter!("enrollment.finished", "status" => status).increment(1);
        if enrollment.status == EnrollmentStatus::Failed {
            warn!(
                enrollment_id = %enrollment.id,
                last_error = ?enrollment.last_error,
                "Enrollment failed"
            );
        } else {
            info!(enrollment_id = %enrollment.id, status, "Enrollment finished");
        }
        self.event_sink
            .emit(EngineEvent::enrollment(event_type, enrollment));
    }
}
