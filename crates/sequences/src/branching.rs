use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::types::{BranchCondition, BranchTarget, Outcome, Sequence};
use serde::Serialize;
use tracing::{debug, warn};

/// Where an enrollment goes once a step's outcome is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Advance {
    /// Continue at the step with this index.
    Step(usize),
    /// No further step exists.
    Complete,
    /// A branch targeted `stop`.
    Exit,
}

/// Evaluates ordered `(outcome, next)` branch conditions, first match wins.
#[derive(Debug, Clone, Default)]
pub struct BranchEvaluator;

impl BranchEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the target of the first condition matching `outcome`.
    pub fn evaluate(
        &self,
        conditions: &[BranchCondition],
        outcome: Outcome,
    ) -> Option<BranchTarget> {
        conditions
            .iter()
            .find(|c| c.on_outcome == outcome)
            .map(|c| c.next)
    }

    /// Resolves what follows the step at `current_index` given its outcome.
    /// Without a match the enrollment moves to the next step in order.
    pub fn resolve_next(
        &self,
        sequence: &Sequence,
        current_index: usize,
        outcome: Outcome,
    ) -> Advance {
        let Some(step) = sequence.steps.get(current_index) else {
            return Advance::Complete;
        };

        match self.evaluate(&step.branch_conditions, outcome) {
            Some(BranchTarget::Stop) => {
                debug!(step_id = %step.id, outcome = outcome.as_str(), "Branch matched stop");
                return Advance::Exit;
            }
            Some(BranchTarget::Step(target)) => match sequence.step_index(&target) {
                Some(index) if index > current_index => {
                    debug!(
                        step_id = %step.id,
                        outcome = outcome.as_str(),
                        target_index = index,
                        "Branch matched step"
                    );
                    return Advance::Step(index);
                }
                _ => {
                    warn!(
                        step_id = %step.id,
                        target = %target,
                        "Branch target missing or not forward, falling through"
                    );
                }
            },
            None => {}
        }

        Self::default_next(sequence, current_index)
    }

    /// Outcome of a step with no matching branch.
    pub fn default_next(sequence: &Sequence, current_index: usize) -> Advance {
        let next = current_index + 1;
        if next < sequence.steps.len() {
            Advance::Step(next)
        } else {
            Advance::Complete
        }
    }
}

/// Time the step at `index` becomes due when the previous step's event
/// happened at `anchor`.
pub fn next_run_at(sequence: &Sequence, index: usize, anchor: DateTime<Utc>) -> DateTime<Utc> {
    match sequence.steps.get(index) {
        Some(step) => anchor + step.delay.as_duration(),
        None => anchor,
    }
}

/// Every branch target must name an existing step strictly after the step
/// that owns the condition.
pub fn validate_targets(sequence: &Sequence) -> OutreachResult<()> {
    for (index, step) in sequence.steps.iter().enumerate() {
        for condition in &step.branch_conditions {
            let BranchTarget::Step(target) = condition.next else {
                continue;
            };
            match sequence.step_index(&target) {
                None => {
                    return Err(OutreachError::Validation(format!(
                        "step {} branches on {} to unknown step {}",
                        step.id,
                        condition.on_outcome.as_str(),
                        target
                    )));
                }
                Some(target_index) if target_index <= index => {
                    return Err(OutreachError::Validation(format!(
                        "step {} branches on {} backwards to step {}",
                        step.id,
                        condition.on_outcome.as_str(),
                        target
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use outreach_core::types::{Channel, Delay, Step};

    fn sequence() -> Sequence {
        let mut sequence = Sequence::new("Cold Outreach Template");
        let last = Step::new(Channel::Social, "Connecting").with_delay(Delay::days(1));
        let middle = Step::new(Channel::Sms, "Following up").with_delay(Delay::days(2));
        let first = Step::new(Channel::Email, "Hello {{first_name}}")
            .with_branch(Outcome::Replied, BranchTarget::Stop)
            .with_branch(Outcome::NoContactMethod, BranchTarget::Step(last.id))
            .with_branch(Outcome::Replied, BranchTarget::Step(middle.id));
        sequence.steps = vec![first, middle, last];
        sequence
    }

    #[test]
    fn test_first_match_wins() {
        let seq = sequence();
        let evaluator = BranchEvaluator::new();
        assert_eq!(
            evaluator.evaluate(&seq.steps[0].branch_conditions, Outcome::Replied),
            Some(BranchTarget::Stop)
        );
        assert_eq!(evaluator.resolve_next(&seq, 0, Outcome::Replied), Advance::Exit);
    }

    #[test]
    fn test_no_match_moves_to_next_step() {
        let seq = sequence();
        let evaluator = BranchEvaluator::new();
        assert_eq!(evaluator.resolve_next(&seq, 0, Outcome::Sent), Advance::Step(1));
        assert_eq!(evaluator.resolve_next(&seq, 2, Outcome::Sent), Advance::Complete);
    }

    #[test]
    fn test_no_contact_method_branch_skips_ahead() {
        let seq = sequence();
        let evaluator = BranchEvaluator::new();
        assert_eq!(
            evaluator.resolve_next(&seq, 0, Outcome::NoContactMethod),
            Advance::Step(2)
        );
    }

    #[test]
    fn test_backward_target_falls_through() {
        let mut seq = sequence();
        let first_id = seq.steps[0].id;
        seq.steps[1] = seq.steps[1]
            .clone()
            .with_branch(Outcome::Opened, BranchTarget::Step(first_id));
        let evaluator = BranchEvaluator::new();
        assert_eq!(evaluator.resolve_next(&seq, 1, Outcome::Opened), Advance::Step(2));
        assert!(validate_targets(&seq).is_err());
    }

    #[test]
    fn test_unknown_target_rejected() {
        let mut seq = sequence();
        seq.steps[1] = seq.steps[1]
            .clone()
            .with_branch(Outcome::Clicked, BranchTarget::Step(uuid::Uuid::new_v4()));
        assert!(matches!(
            validate_targets(&seq),
            Err(OutreachError::Validation(_))
        ));
        assert!(validate_targets(&sequence()).is_ok());
    }

    #[test]
    fn test_next_run_at_adds_step_delay() {
        let seq = sequence();
        let t = Utc::now();
        assert_eq!(next_run_at(&seq, 0, t), t);
        assert_eq!(next_run_at(&seq, 1, t), t + Duration::days(2));
        assert_eq!(next_run_at(&seq, 2, t), t + Duration::days(1));
    }
}
