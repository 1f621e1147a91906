//! Persistence seams for sequences, enrollments, and the delivery event log.
//!
//! The engine only ever talks to these traits. `InMemoryStore` backs all three
//! with `DashMap`/`RwLock` for single-node deployments and tests; a durable
//! backend implements the same contract.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{OutreachError, OutreachResult};
use crate::types::{DeliveryEvent, Enrollment, Sequence};

/// Closure applied inside an atomic read-modify-write. Returning an error
/// discards every change the closure made.
pub type Mutation<'a, T> = &'a mut dyn FnMut(&mut T) -> OutreachResult<()>;

pub trait SequenceStore: Send + Sync {
    fn get_sequence(&self, id: &Uuid) -> Option<Sequence>;
    fn put_sequence(&self, sequence: Sequence);
    fn remove_sequence(&self, id: &Uuid) -> Option<Sequence>;
    fn list_sequences(&self) -> Vec<Sequence>;
    fn update_sequence(&self, id: &Uuid, mutation: Mutation<'_, Sequence>)
        -> OutreachResult<Sequence>;
}

pub trait EnrollmentStore: Send + Sync {
    /// Fails with `InvalidState` if the (sequence, prospect) pair is taken.
    fn insert_enrollment(&self, enrollment: Enrollment) -> OutreachResult<()>;
    fn get_enrollment(&self, id: &Uuid) -> Option<Enrollment>;
    fn find_enrollment(&self, sequence_id: &Uuid, prospect_id: &str) -> Option<Enrollment>;
    fn enrollments_for_sequence(&self, sequence_id: &Uuid) -> Vec<Enrollment>;
    fn list_enrollments(&self) -> Vec<Enrollment>;
    /// Pending or in-progress enrollments with `next_run_at <= now`.
    fn due_enrollments(&self, now: DateTime<Utc>) -> Vec<Enrollment>;
    fn update_enrollment(
        &self,
        id: &Uuid,
        mutation: Mutation<'_, Enrollment>,
    ) -> OutreachResult<Enrollment>;
}

/// Append-only log of delivery events. Safe for concurrent writers.
pub trait EventLog: Send + Sync {
    fn append(&self, event: DeliveryEvent);
    /// Consistent copy of every event recorded so far.
    fn snapshot(&self) -> Vec<DeliveryEvent>;
    fn events_for_enrollment(&self, enrollment_id: &Uuid) -> Vec<DeliveryEvent>;
    fn events_for_sequence(&self, sequence_id: &Uuid) -> Vec<DeliveryEvent>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct InMemoryStore {
    sequences: DashMap<Uuid, Sequence>,
    enrollments: DashMap<Uuid, Enrollment>,
    /// (sequence_id, prospect_id) -> enrollment_id
    enrollment_index: DashMap<(Uuid, String), Uuid>,
    events: RwLock<Vec<DeliveryEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("sequences", &self.sequences.len())
            .field("enrollments", &self.enrollments.len())
            .field("events", &self.events.read().len())
            .finish()
    }
}

impl SequenceStore for InMemoryStore {
    fn get_sequence(&self, id: &Uuid) -> Option<Sequence> {
        self.sequences.get(id).map(|r| r.clone())
    }

    fn put_sequence(&self, sequence: Sequence) {
        self.sequences.insert(sequence.id, sequence);
    }

    fn remove_sequence(&self, id: &Uuid) -> Option<Sequence> {
        self.sequences.remove(id).map(|(_, s)| s)
    }

    fn list_sequences(&self) -> Vec<Sequence> {
        let mut all: Vec<Sequence> = self.sequences.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    fn update_sequence(
        &self,
        id: &Uuid,
        mutation: Mutation<'_, Sequence>,
    ) -> OutreachResult<Sequence> {
        let mut entry = self
            .sequences
            .get_mut(id)
            .ok_or_else(|| OutreachError::NotFound(format!("sequence {}", id)))?;
        let mut draft = entry.clone();
        mutation(&mut draft)?;
        *entry = draft.clone();
        Ok(draft)
    }
}

impl EnrollmentStore for InMemoryStore {
    fn insert_enrollment(&self, enrollment: Enrollment) -> OutreachResult<()> {
        let key = (enrollment.sequence_id, enrollment.prospect_id.clone());
        match self.enrollment_index.entry(key) {
            Entry::Occupied(existing) => Err(OutreachError::InvalidState(format!(
                "prospect {} is already enrolled in sequence {} (enrollment {})",
                enrollment.prospect_id,
                enrollment.sequence_id,
                existing.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(enrollment.id);
                self.enrollments.insert(enrollment.id, enrollment);
                Ok(())
            }
        }
    }

    fn get_enrollment(&self, id: &Uuid) -> Option<Enrollment> {
        self.enrollments.get(id).map(|r| r.clone())
    }

    fn find_enrollment(&self, sequence_id: &Uuid, prospect_id: &str) -> Option<Enrollment> {
        let id = *self
            .enrollment_index
            .get(&(*sequence_id, prospect_id.to_string()))?;
        self.get_enrollment(&id)
    }

    fn enrollments_for_sequence(&self, sequence_id: &Uuid) -> Vec<Enrollment> {
        let mut found: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().sequence_id == *sequence_id)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|e| e.enrolled_at);
        found
    }

    fn list_enrollments(&self) -> Vec<Enrollment> {
        self.enrollments.iter().map(|r| r.value().clone()).collect()
    }

    fn due_enrollments(&self, now: DateTime<Utc>) -> Vec<Enrollment> {
        let mut due: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().status.is_schedulable() && r.value().next_run_at <= now)
            .map(|r| r.value().clone())
            .collect();
        due.sort_by_key(|e| e.next_run_at);
        due
    }

    fn update_enrollment(
        &self,
        id: &Uuid,
        mutation: Mutation<'_, Enrollment>,
    ) -> OutreachResult<Enrollment> {
        let mut entry = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {}", id)))?;
        let mut draft = entry.clone();
        mutation(&mut draft)?;
        *entry = draft.clone();
        Ok(draft)
    }
}

impl EventLog for InMemoryStore {
    fn append(&self, event: DeliveryEvent) {
        self.events.write().push(event);
    }

    fn snapshot(&self) -> Vec<DeliveryEvent> {
        self.events.read().clone()
    }

    fn events_for_enrollment(&self, enrollment_id: &Uuid) -> Vec<DeliveryEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.enrollment_id == *enrollment_id)
            .cloned()
            .collect()
    }

    fn events_for_sequence(&self, sequence_id: &Uuid) -> Vec<DeliveryEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.sequence_id == *sequence_id)
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.events.read().len()
    }
}
