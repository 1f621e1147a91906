//! Funnel analytics over the delivery event log.
//!
//! Every figure here is recomputed from `DeliveryEvent`s; nothing is stored
//! authoritatively. Aggregation is a pure fold, so any permutation of the same
//! events yields identical metrics.

pub mod aggregator;
pub mod rollup;
pub mod summary;
pub mod tiers;

pub use aggregator::{aggregate, aggregate_unique, CampaignMetrics};
pub use rollup::{
    by_campaign, by_sequence, by_step, by_weekday, CampaignRollup, StepMetrics, WeekdayMetrics,
};
pub use summary::{summarize, EnrollmentCounts, SequenceSummary};
pub use tiers::{PerformanceReport, PerformanceTier, RateKind};
