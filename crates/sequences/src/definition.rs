//! Sequence definition commands: authoring, lifecycle, and the
//! dispatched-prefix rule for editing live sequences.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::EventSink;
use outreach_core::store::{EnrollmentStore, SequenceStore};
use outreach_core::types::{
    BranchTarget, Channel, EngineEvent, EngineEventType, Sequence, SequenceStatus, Step,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::branching::validate_targets;

/// Owns sequence definitions and enforces their lifecycle.
#[derive(Clone)]
pub struct SequenceRegistry {
    sequences: Arc<dyn SequenceStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRegistry")
            .field("sequences", &self.sequences.list_sequences().len())
            .finish()
    }
}

impl SequenceRegistry {
    pub fn new(sequences: Arc<dyn SequenceStore>, enrollments: Arc<dyn EnrollmentStore>) -> Self {
        Self {
            sequences,
            enrollments,
            event_sink: outreach_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Creates an empty draft sequence.
    pub fn create_sequence(
        &self,
        name: &str,
        campaign_id: Option<String>,
    ) -> OutreachResult<Sequence> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OutreachError::Validation(
                "sequence name must not be empty".into(),
            ));
        }
        let mut sequence = Sequence::new(name);
        sequence.campaign_id = campaign_id;
        info!(sequence_id = %sequence.id, name = %sequence.name, "Creating sequence");
        self.sequences.put_sequence(sequence.clone());
        Ok(sequence)
    }

    pub fn get_sequence(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.sequences
            .get_sequence(id)
            .ok_or_else(|| OutreachError::NotFound(format!("sequence {}", id)))
    }

    pub fn list_sequences(&self) -> Vec<Sequence> {
        self.sequences.list_sequences()
    }

    /// Moves the sequence into another campaign, or out of any. Allowed in
    /// every status; a blank id clears the campaign.
    pub fn set_campaign(&self, id: &Uuid, campaign_id: Option<String>) -> OutreachResult<Sequence> {
        let campaign_id = campaign_id
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let updated = self.sequences.update_sequence(id, &mut |seq| {
            seq.campaign_id = campaign_id.clone();
            seq.last_modified = Utc::now();
            Ok(())
        })?;
        info!(sequence_id = %id, campaign_id = ?updated.campaign_id, "Sequence campaign set");
        Ok(updated)
    }

    /// Appends `step`, or inserts it at `position`.
    ///
    /// On an active or paused sequence the position must lie after every
    /// position an enrollment has already reached.
    pub fn add_step(
        &self,
        id: &Uuid,
        step: Step,
        position: Option<usize>,
    ) -> OutreachResult<Sequence> {
        let updated = self.sequences.update_sequence(id, &mut |seq| {
            ensure_editable(seq)?;
            let frozen = self.frozen_prefix(seq, Utc::now());
            let position = position.unwrap_or(seq.steps.len());
            if position > seq.steps.len() {
                return Err(OutreachError::Validation(format!(
                    "position {} is beyond the {} existing steps",
                    position,
                    seq.steps.len()
                )));
            }
            if seq.status != SequenceStatus::Draft && position < frozen {
                return Err(OutreachError::InvalidState(format!(
                    "position {} has already been dispatched",
                    position
                )));
            }
            if seq.steps.iter().any(|s| s.id == step.id) {
                return Err(OutreachError::Validation(format!(
                    "step {} already exists in sequence",
                    step.id
                )));
            }
            validate_step(&step, position)?;

            seq.steps.insert(position, step.clone());
            if seq.status != SequenceStatus::Draft {
                validate_for_activation(seq)?;
            }
            seq.last_modified = Utc::now();
            Ok(())
        })?;

        info!(
            sequence_id = %id,
            step_id = %step.id,
            channel = step.channel.display_name(),
            steps = updated.steps.len(),
            "Step added"
        );
        Ok(updated)
    }

    /// Replaces the step with `step.id`. Dispatched steps are immutable.
    pub fn update_step(&self, id: &Uuid, step: Step) -> OutreachResult<Sequence> {
        let updated = self.sequences.update_sequence(id, &mut |seq| {
            ensure_editable(seq)?;
            let frozen = self.frozen_prefix(seq, Utc::now());
            let position = seq.step_index(&step.id).ok_or_else(|| {
                OutreachError::NotFound(format!("step {} in sequence {}", step.id, seq.id))
            })?;
            if seq.status != SequenceStatus::Draft && position < frozen {
                return Err(OutreachError::InvalidState(format!(
                    "step {} has already been dispatched",
                    step.id
                )));
            }
            validate_step(&step, position)?;

            seq.steps[position] = step.clone();
            if seq.status != SequenceStatus::Draft {
                validate_for_activation(seq)?;
            }
            seq.last_modified = Utc::now();
            Ok(())
        })?;

        info!(sequence_id = %id, step_id = %step.id, "Step updated");
        Ok(updated)
    }

    /// Removes a step from a draft sequence, dropping branches that pointed at it.
    pub fn remove_step(&self, id: &Uuid, step_id: &Uuid) -> OutreachResult<Sequence> {
        let updated = self.sequences.update_sequence(id, &mut |seq| {
            if seq.status != SequenceStatus::Draft {
                return Err(OutreachError::InvalidState(format!(
                    "steps can only be removed from a draft sequence (status {:?})",
                    seq.status
                )));
            }
            let position = seq.step_index(step_id).ok_or_else(|| {
                OutreachError::NotFound(format!("step {} in sequence {}", step_id, seq.id))
            })?;
            seq.steps.remove(position);
            for step in seq.steps.iter_mut() {
                step.branch_conditions
                    .retain(|c| c.next != BranchTarget::Step(*step_id));
            }
            seq.last_modified = Utc::now();
            Ok(())
        })?;

        info!(sequence_id = %id, step_id = %step_id, "Step removed");
        Ok(updated)
    }

    pub fn activate(&self, id: &Uuid) -> OutreachResult<Sequence> {
        let updated = self.sequences.update_sequence(id, &mut |seq| {
            if seq.status != SequenceStatus::Draft {
                return Err(OutreachError::InvalidState(format!(
                    "only draft sequences can be activated (status {:?})",
                    seq.status
                )));
            }
            validate_for_activation(seq)?;
            seq.status = SequenceStatus::Active;
            seq.last_modified = Utc::now();
            Ok(())
        })?;

        info!(sequence_id = %id, steps = updated.steps.len(), "Sequence activated");
        self.emit(EngineEventType::SequenceActivated, *id);
        Ok(updated)
    }

    /// Stops new dispatches. In-flight dispatches still record.
    pub fn pause(&self, id: &Uuid) -> OutreachResult<Sequence> {
        let updated = self.transition(id, SequenceStatus::Active, SequenceStatus::Paused)?;
        info!(sequence_id = %id, "Sequence paused");
        self.emit(EngineEventType::SequencePaused, *id);
        Ok(updated)
    }

    pub fn resume(&self, id: &Uuid) -> OutreachResult<Sequence> {
        let updated = self.transition(id, SequenceStatus::Paused, SequenceStatus::Active)?;
        info!(sequence_id = %id, "Sequence resumed");
        self.emit(EngineEventType::SequenceResumed, *id);
        Ok(updated)
    }

    /// Archiving is terminal and allowed from draft or paused.
    pub fn archive(&self, id: &Uuid) -> OutreachResult<Sequence> {
        let updated = self.sequences.update_sequence(id, &mut |seq| {
            match seq.status {
                SequenceStatus::Draft | SequenceStatus::Paused => {}
                SequenceStatus::Active => {
                    return Err(OutreachError::InvalidState(
                        "pause an active sequence before archiving it".into(),
                    ));
                }
                SequenceStatus::Archived => {
                    return Err(OutreachError::InvalidState(
                        "sequence is already archived".into(),
                    ));
                }
            }
            seq.status = SequenceStatus::Archived;
            seq.last_modified = Utc::now();
            Ok(())
        })?;

        info!(sequence_id = %id, "Sequence archived");
        self.emit(EngineEventType::SequenceArchived, *id);
        Ok(updated)
    }

    /// Copies a sequence into a new draft named "<name> (Copy)" with fresh
    /// step ids. Branch targets follow their steps.
    pub fn duplicate(&self, id: &Uuid) -> OutreachResult<Sequence> {
        let source = self.get_sequence(id)?;
        let mut copy = Sequence::new(format!("{} (Copy)", source.name));
        copy.campaign_id = source.campaign_id.clone();

        let ids: HashMap<Uuid, Uuid> = source
            .steps
            .iter()
            .map(|s| (s.id, Uuid::new_v4()))
            .collect();
        copy.steps = source
            .steps
            .iter()
            .map(|s| {
                let mut step = s.clone();
                step.id = ids[&s.id];
                for condition in step.branch_conditions.iter_mut() {
                    if let BranchTarget::Step(target) = condition.next {
                        if let Some(mapped) = ids.get(&target) {
                            condition.next = BranchTarget::Step(*mapped);
                        }
                    }
                }
                step
            })
            .collect();

        info!(source_id = %id, sequence_id = %copy.id, "Sequence duplicated");
        self.sequences.put_sequence(copy.clone());
        Ok(copy)
    }

    /// Deletes a sequence that is not active and has never enrolled anyone.
    pub fn delete(&self, id: &Uuid) -> OutreachResult<()> {
        let sequence = self.get_sequence(id)?;
        if sequence.status == SequenceStatus::Active {
            return Err(OutreachError::InvalidState(
                "active sequences cannot be deleted".into(),
            ));
        }
        let enrolled = self.enrollments.enrollments_for_sequence(id).len();
        if enrolled > 0 {
            return Err(OutreachError::InvalidState(format!(
                "sequence has {} enrollments",
                enrolled
            )));
        }
        self.sequences.remove_sequence(id);
        info!(sequence_id = %id, "Sequence deleted");
        Ok(())
    }

    /// Number of leading positions that can no longer change. Steps below
    /// this index are immutable.
    pub fn frozen_prefix_len(&self, id: &Uuid) -> usize {
        self.sequences
            .get_sequence(id)
            .map(|sequence| self.frozen_prefix(&sequence, Utc::now()))
            .unwrap_or(0)
    }

    /// Every position an enrollment has dispatched or moved past, plus the
    /// current step of any unfinished enrollment that is due at `now` and may
    /// be in flight. Edits call this while holding the sequence for update.
    fn frozen_prefix(&self, sequence: &Sequence, now: DateTime<Utc>) -> usize {
        self.enrollments
            .enrollments_for_sequence(&sequence.id)
            .iter()
            .map(|enrollment| {
                let dispatched = enrollment
                    .history
                    .iter()
                    .filter_map(|event| sequence.step_index(&event.step_id))
                    .map(|index| index + 1)
                    .max()
                    .unwrap_or(0);
                if enrollment.status.is_terminal() {
                    dispatched
                } else if enrollment.next_run_at <= now {
                    dispatched.max(enrollment.current_step_index + 1)
                } else {
                    dispatched.max(enrollment.current_step_index)
                }
            })
            .max()
            .unwrap_or(0)
    }

    fn transition(
        &self,
        id: &Uuid,
        from: SequenceStatus,
        to: SequenceStatus,
    ) -> OutreachResult<Sequence> {
        self.sequences.update_sequence(id, &mut |seq| {
            if seq.status != from {
                return Err(OutreachError::InvalidState(format!(
                    "cannot move sequence from {:?} to {:?}",
                    seq.status, to
                )));
            }
            seq.status = to;
            seq.last_modified = Utc::now();
            Ok(())
        })
    }

    fn emit(&self, event_type: EngineEventType, sequence_id: Uuid) {
        self.event_sink
            .emit(EngineEvent::sequence(event_type, sequence_id));
    }
}

fn ensure_editable(sequence: &Sequence) -> OutreachResult<()> {
    if sequence.status == SequenceStatus::Archived {
        warn!(sequence_id = %sequence.id, "Rejected edit of archived sequence");
        return Err(OutreachError::InvalidState(
            "archived sequences cannot be edited".into(),
        ));
    }
    Ok(())
}

/// Checks that hold for a single step at `position`.
pub fn validate_step(step: &Step, position: usize) -> OutreachResult<()> {
    if step.subject.is_some() && step.channel != Channel::Email {
        return Err(OutreachError::Validation(format!(
            "{} steps cannot carry a subject",
            step.channel.display_name()
        )));
    }
    if position == 0 && !step.delay.is_zero() {
        return Err(OutreachError::Validation(
            "the first step must have zero delay".into(),
        ));
    }
    Ok(())
}

/// Full set of checks a sequence must pass before it can run.
pub fn validate_for_activation(sequence: &Sequence) -> OutreachResult<()> {
    if sequence.steps.is_empty() {
        return Err(OutreachError::Validation(
            "a sequence needs at least one step".into(),
        ));
    }
    let mut seen = HashSet::new();
    for (position, step) in sequence.steps.iter().enumerate() {
        if !seen.insert(step.id) {
            return Err(OutreachError::Validation(format!(
                "duplicate step id {}",
                step.id
            )));
        }
        if step.body_template.trim().is_empty() {
            return Err(OutreachError::Validation(format!(
                "step {} has an empty body",
                position + 1
            )));
        }
        validate_step(step, position)?;
    }
    validate_targets(sequence)
}
