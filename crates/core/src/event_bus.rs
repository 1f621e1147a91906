//! Lifecycle events for sequences and enrollments.
//!
//! The registry, scheduler and engine hand every state change they make to an
//! `Arc<dyn EventSink>`. Delivery outcomes live in the event log; this is the
//! operational trail (activations, dispatches, expired leases, finishes).

use crate::types::{EngineEvent, EngineEventType, Enrollment};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

impl EngineEvent {
    /// Event about a sequence as a whole.
    pub fn sequence(event_type: EngineEventType, sequence_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            sequence_id,
            enrollment_id: None,
            prospect_id: None,
            step_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Event about one enrollment, tagged with its prospect.
    pub fn enrollment(event_type: EngineEventType, enrollment: &Enrollment) -> Self {
        Self {
            enrollment_id: Some(enrollment.id),
            prospect_id: Some(enrollment.prospect_id.clone()),
            ..Self::sequence(event_type, enrollment.sequence_id)
        }
    }

    pub fn at_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Writes each event as a structured log record stamped with the node id.
pub struct TracingSink {
    node_id: String,
}

impl TracingSink {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        tracing::info!(
            node_id = %self.node_id,
            event_id = %event.event_id,
            event_type = ?event.event_type,
            sequence_id = %event.sequence_id,
            enrollment_id = ?event.enrollment_id,
            prospect_id = ?event.prospect_id,
            step_id = ?event.step_id,
            "Lifecycle event"
        );
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn recorded(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count_of(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Event types emitted for one enrollment, oldest first.
    pub fn trail(&self, enrollment_id: &Uuid) -> Vec<EngineEventType> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.enrollment_id.as_ref() == Some(enrollment_id))
            .map(|e| e.event_type)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn recording_sink() -> Arc<RecordingSink> {
    Arc::new(RecordingSink::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(prospect_id: &str) -> Enrollment {
        Enrollment::new(Uuid::new_v4(), prospect_id, Utc::now())
    }

    #[test]
    fn test_enrollment_event_carries_prospect_and_step() {
        let enrollment = enrollment("p-dana");
        let step_id = Uuid::new_v4();
        let event = EngineEvent::enrollment(EngineEventType::StepDispatched, &enrollment)
            .at_step(step_id);

        assert_eq!(event.sequence_id, enrollment.sequence_id);
        assert_eq!(event.enrollment_id, Some(enrollment.id));
        assert_eq!(event.prospect_id.as_deref(), Some("p-dana"));
        assert_eq!(event.step_id, Some(step_id));

        let activated = EngineEvent::sequence(EngineEventType::SequenceActivated, Uuid::new_v4());
        assert!(activated.enrollment_id.is_none());
        assert!(activated.step_id.is_none());
    }

    #[test]
    fn test_recording_sink_keeps_enrollment_trail() {
        let sink = recording_sink();
        let dana = enrollment("p-dana");
        let sam = enrollment("p-sam");
        let step_id = Uuid::new_v4();

        sink.emit(EngineEvent::enrollment(EngineEventType::EnrollmentCreated, &dana));
        sink.emit(EngineEvent::enrollment(EngineEventType::EnrollmentCreated, &sam));
        sink.emit(
            EngineEvent::enrollment(EngineEventType::StepDispatched, &dana).at_step(step_id),
        );
        sink.emit(EngineEvent::enrollment(EngineEventType::EnrollmentCompleted, &dana));
        sink.emit(EngineEvent::sequence(EngineEventType::SequencePaused, dana.sequence_id));

        assert_eq!(
            sink.trail(&dana.id),
            vec![
                EngineEventType::EnrollmentCreated,
                EngineEventType::StepDispatched,
                EngineEventType::EnrollmentCompleted,
            ]
        );
        assert_eq!(sink.trail(&sam.id), vec![EngineEventType::EnrollmentCreated]);
        assert_eq!(sink.count_of(EngineEventType::EnrollmentCreated), 2);
        assert_eq!(sink.recorded().len(), 5);
    }

    #[test]
    fn test_sinks_accept_events() {
        let event = EngineEvent::sequence(EngineEventType::SequenceArchived, Uuid::new_v4());
        noop_sink().emit(event.clone());
        TracingSink::new("node-a").emit(event);
    }
}
