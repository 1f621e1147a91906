use chrono::{DateTime, Utc};
use outreach_core::types::{
    Channel, DeliveryEvent, Enrollment, EnrollmentStatus, Sequence, SequenceStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregator::aggregate;
use crate::tiers::PerformanceReport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub exited: u64,
    pub failed: u64,
}

impl EnrollmentCounts {
    pub fn tally<'a>(enrollments: impl IntoIterator<Item = &'a Enrollment>) -> Self {
        let mut counts = Self::default();
        for enrollment in enrollments {
            match enrollment.status {
                EnrollmentStatus::Pending => counts.pending += 1,
                EnrollmentStatus::InProgress => counts.in_progress += 1,
                EnrollmentStatus::Completed => counts.completed += 1,
                EnrollmentStatus::Exited => counts.exited += 1,
                EnrollmentStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.exited + self.failed
    }
}

/// One card of the sequence list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub sequence_id: Uuid,
    pub name: String,
    pub status: SequenceStatus,
    pub campaign_id: Option<String>,
    pub step_count: usize,
    pub channels: Vec<Channel>,
    pub prospects: u64,
    pub enrollments: EnrollmentCounts,
    pub sent: u64,
    pub opened: u64,
    pub replied: u64,
    pub open_rate: f64,
    pub reply_rate: f64,
    pub performance: PerformanceReport,
    pub last_modified: DateTime<Utc>,
}

/// Builds the summary for `sequence`. Enrollments and events of other
/// sequences are ignored.
pub fn summarize(
    sequence: &Sequence,
    enrollments: &[Enrollment],
    events: &[DeliveryEvent],
) -> SequenceSummary {
    let own_enrollments: Vec<&Enrollment> = enrollments
        .iter()
        .filter(|e| e.sequence_id == sequence.id)
        .collect();
    let counts = EnrollmentCounts::tally(own_enrollments.iter().copied());
    let metrics = aggregate(events.iter().filter(|e| e.sequence_id == sequence.id));

    let mut channels: Vec<Channel> = Vec::new();
    for step in &sequence.steps {
        if !channels.contains(&step.channel) {
            channels.push(step.channel);
        }
    }

    SequenceSummary {
        sequence_id: sequence.id,
        name: sequence.name.clone(),
        status: sequence.status,
        campaign_id: sequence.campaign_id.clone(),
        step_count: sequence.steps.len(),
        channels,
        prospects: counts.total(),
        enrollments: counts,
        sent: metrics.sent,
        opened: metrics.opened,
        replied: metrics.replied,
        open_rate: metrics.open_rate,
        reply_rate: metrics.reply_rate,
        performance: PerformanceReport::grade(&metrics),
        last_modified: sequence.last_modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::event;
    use crate::tiers::PerformanceTier;
    use outreach_core::types::{Outcome, Step};

    #[test]
    fn test_summary_counts_only_own_sequence() {
        let mut sequence = Sequence::new("SaaS Decision Makers");
        sequence.steps = vec![
            Step::new(Channel::Email, "One"),
            Step::new(Channel::Sms, "Two"),
            Step::new(Channel::Email, "Three"),
        ];
        let now = Utc::now();
        let mut done = Enrollment::new(sequence.id, "p-1", now);
        done.status = EnrollmentStatus::Completed;
        let running = Enrollment::new(sequence.id, "p-2", now);
        let elsewhere = Enrollment::new(Uuid::new_v4(), "p-3", now);

        let step = sequence.steps[0].id;
        let events = vec![
            event(done.id, sequence.id, step, Outcome::Sent, now),
            event(running.id, sequence.id, step, Outcome::Sent, now),
            event(done.id, sequence.id, step, Outcome::Opened, now),
            event(done.id, sequence.id, step, Outcome::Replied, now),
            event(elsewhere.id, elsewhere.sequence_id, step, Outcome::Sent, now),
        ];

        let summary = summarize(&sequence, &[done, running, elsewhere], &events);
        assert_eq!(summary.step_count, 3);
        assert_eq!(summary.channels, vec![Channel::Email, Channel::Sms]);
        assert_eq!(summary.prospects, 2);
        assert_eq!(summary.enrollments.completed, 1);
        assert_eq!(summary.enrollments.pending, 1);
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.open_rate, 50.0);
        assert_eq!(summary.reply_rate, 50.0);
        assert_eq!(summary.performance.reply, PerformanceTier::Good);
    }

    #[test]
    fn test_empty_sequence_summary() {
        let sequence = Sequence::new("Cold Outreach Template");
        let summary = summarize(&sequence, &[], &[]);
        assert_eq!(summary.prospects, 0);
        assert_eq!(summary.open_rate, 0.0);
        assert_eq!(summary.performance.open, PerformanceTier::Poor);
        assert_eq!(summary.performance.bounce, PerformanceTier::Good);
    }
}
