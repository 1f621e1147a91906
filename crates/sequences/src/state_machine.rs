use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::types::EnrollmentStatus;
use serde::Serialize;

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: &'static str,
}

/// Every transition an enrollment may take. Terminal states have no
/// outgoing edges.
pub const TRANSITIONS: &[StateTransition] = &[
    // Pending ->
    StateTransition {
        from: EnrollmentStatus::Pending,
        to: EnrollmentStatus::InProgress,
        trigger: "first_step_due",
    },
    StateTransition {
        from: EnrollmentStatus::Pending,
        to: EnrollmentStatus::Completed,
        trigger: "single_step_sequence_done",
    },
    StateTransition {
        from: EnrollmentStatus::Pending,
        to: EnrollmentStatus::Exited,
        trigger: "stop_outcome",
    },
    StateTransition {
        from: EnrollmentStatus::Pending,
        to: EnrollmentStatus::Failed,
        trigger: "dispatch_failed",
    },
    // InProgress ->
    StateTransition {
        from: EnrollmentStatus::InProgress,
        to: EnrollmentStatus::InProgress,
        trigger: "step_advanced",
    },
    StateTransition {
        from: EnrollmentStatus::InProgress,
        to: EnrollmentStatus::Completed,
        trigger: "steps_exhausted",
    },
    StateTransition {
        from: EnrollmentStatus::InProgress,
        to: EnrollmentStatus::Exited,
        trigger: "stop_outcome",
    },
    StateTransition {
        from: EnrollmentStatus::InProgress,
        to: EnrollmentStatus::Failed,
        trigger: "dispatch_failed",
    },
];

/// Guards enrollment lifecycle by enforcing the finite set of valid
/// state transitions.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub state: EnrollmentStatus,
}

impl EnrollmentStateMachine {
    pub fn new(state: EnrollmentStatus) -> Self {
        Self { state }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// Attempts to move the state machine to `to`. Returns `InvalidState` if
    /// the transition is not permitted.
    pub fn transition(&mut self, to: EnrollmentStatus) -> OutreachResult<()> {
        if Self::can_transition(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(OutreachError::InvalidState(format!(
                "invalid enrollment transition from {:?} to {:?}",
                self.state, to
            )))
        }
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new(EnrollmentStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = EnrollmentStateMachine::default();
        sm.transition(EnrollmentStatus::InProgress).unwrap();
        sm.transition(EnrollmentStatus::InProgress).unwrap();
        sm.transition(EnrollmentStatus::Completed).unwrap();
        assert_eq!(sm.state, EnrollmentStatus::Completed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            EnrollmentStatus::Completed,
            EnrollmentStatus::Exited,
            EnrollmentStatus::Failed,
        ] {
            for to in [
                EnrollmentStatus::Pending,
                EnrollmentStatus::InProgress,
                EnrollmentStatus::Completed,
                EnrollmentStatus::Exited,
                EnrollmentStatus::Failed,
            ] {
                assert!(!EnrollmentStateMachine::can_transition(terminal, to));
            }
        }
    }

    #[test]
    fn test_cannot_return_to_pending() {
        let mut sm = EnrollmentStateMachine::new(EnrollmentStatus::InProgress);
        let err = sm.transition(EnrollmentStatus::Pending).unwrap_err();
        assert!(matches!(err, OutreachError::InvalidState(_)));
        assert_eq!(sm.state, EnrollmentStatus::InProgress);
    }
}
