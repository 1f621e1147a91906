use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Step definition ────────────────────────────────────────────────────────

/// Outreach channel a step is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Social,
}

impl Channel {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Social => "social",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Hours,
    Days,
}

/// Wait between the previous step's dispatch and this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub amount: u32,
    pub unit: DelayUnit,
}

impl Delay {
    pub const fn zero() -> Self {
        Self {
            amount: 0,
            unit: DelayUnit::Days,
        }
    }

    pub const fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Hours,
        }
    }

    pub const fn days(amount: u32) -> Self {
        Self {
            amount,
            unit: DelayUnit::Days,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    /// Hours are 3600s, days are 86400s.
    pub fn as_duration(&self) -> Duration {
        let unit_secs: i64 = match self.unit {
            DelayUnit::Hours => 3_600,
            DelayUnit::Days => 86_400,
        };
        Duration::seconds(i64::from(self.amount) * unit_secs)
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::zero()
    }
}

/// Result of delivering (or attempting to deliver) one step.
///
/// `NoContactMethod` is a pseudo-outcome: branch conditions may match on it,
/// but it is never written to the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Replied,
    Bounced,
    Unsubscribed,
    Failed,
    NoContactMethod,
}

impl Outcome {
    /// Outcomes reported asynchronously by a channel adapter after `sent`.
    pub fn is_downstream(&self) -> bool {
        matches!(
            self,
            Self::Delivered
                | Self::Opened
                | Self::Clicked
                | Self::Replied
                | Self::Bounced
                | Self::Unsubscribed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Replied => "replied",
            Self::Bounced => "bounced",
            Self::Unsubscribed => "unsubscribed",
            Self::Failed => "failed",
            Self::NoContactMethod => "no_contact_method",
        }
    }
}

/// Where an enrollment goes after a matching branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchTarget {
    Step(Uuid),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCondition {
    pub on_outcome: Outcome,
    pub next: BranchTarget,
}

/// One outreach action inside a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub channel: Channel,
    #[serde(default)]
    pub delay: Delay,
    /// Email only.
    #[serde(default)]
    pub subject: Option<String>,
    pub body_template: String,
    #[serde(default)]
    pub branch_conditions: Vec<BranchCondition>,
}

impl Step {
    pub fn new(channel: Channel, body_template: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            delay: Delay::zero(),
            subject: None,
            body_template: body_template.into(),
            branch_conditions: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_branch(mut self, on_outcome: Outcome, next: BranchTarget) -> Self {
        self.branch_conditions
            .push(BranchCondition { on_outcome, next });
        self
    }
}

// ─── Sequence definition ────────────────────────────────────────────────────

/// Lifecycle status of a sequence definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// An ordered, multi-channel outreach sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    /// Groups sequences for campaign-level rollups.
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub status: SequenceStatus,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            campaign_id: None,
            status: SequenceStatus::Draft,
            steps: Vec::new(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn step_index(&self, step_id: &Uuid) -> Option<usize> {
        self.steps.iter().position(|s| s.id == *step_id)
    }

    pub fn step(&self, step_id: &Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == *step_id)
    }
}

// ─── Enrollment ─────────────────────────────────────────────────────────────

/// Runtime status of one prospect's progress through a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    InProgress,
    Completed,
    Exited,
    Failed,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Exited | Self::Failed)
    }

    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Binding of one prospect to one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub prospect_id: String,
    pub current_step_index: usize,
    pub status: EnrollmentStatus,
    pub next_run_at: DateTime<Utc>,
    /// One terminal dispatch event per dispatched step.
    pub history: Vec<DeliveryEvent>,
    /// Dispatch attempts made for the current step.
    pub attempts: u32,
    /// Step id and dispatch time of the most recent successful dispatch.
    pub last_dispatch: Option<(Uuid, DateTime<Utc>)>,
    pub last_error: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(sequence_id: Uuid, prospect_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id,
            prospect_id: prospect_id.into(),
            current_step_index: 0,
            status: EnrollmentStatus::Pending,
            next_run_at: now,
            history: Vec::new(),
            attempts: 0,
            last_dispatch: None,
            last_error: None,
            enrolled_at: now,
            updated_at: now,
        }
    }
}

// ─── Delivery events ────────────────────────────────────────────────────────

/// Append-only record of something that happened to a dispatched step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub sequence_id: Uuid,
    pub step_id: Uuid,
    pub channel: Channel,
    pub outcome: Outcome,
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn new(
        enrollment: &Enrollment,
        step: &Step,
        outcome: Outcome,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            sequence_id: enrollment.sequence_id,
            step_id: step.id,
            channel: step.channel,
            outcome,
            occurred_at,
        }
    }
}

// ─── Prospect directory record ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: String,
    pub first_name: String,
    pub company_name: String,
    pub industry: String,
    pub recent_news: String,
    pub email: String,
    pub phone: Option<String>,
    pub social_handle: Option<String>,
}

// ─── Engine lifecycle events ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    SequenceActivated,
    SequencePaused,
    SequenceResumed,
    SequenceArchived,
    EnrollmentCreated,
    StepDispatched,
    StepFailed,
    StepSkipped,
    EnrollmentCompleted,
    EnrollmentExited,
    EnrollmentFailed,
    LeaseExpired,
}

/// Operational event emitted through an `EventSink`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub sequence_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub prospect_id: Option<String>,
    pub step_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}
