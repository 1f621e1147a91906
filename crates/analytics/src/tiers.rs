use serde::{Deserialize, Serialize};

use crate::aggregator::CampaignMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    Good,
    Average,
    Poor,
}

/// Rates the dashboard grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKind {
    Open,
    Click,
    Reply,
    Bounce,
}

impl RateKind {
    /// `(good, average)` cut-offs in percent.
    pub fn thresholds(&self) -> (f64, f64) {
        match self {
            Self::Open => (25.0, 15.0),
            Self::Click => (10.0, 5.0),
            Self::Reply => (8.0, 3.0),
            Self::Bounce => (2.0, 5.0),
        }
    }

    /// Grades `rate`. Bounce is better when lower.
    pub fn tier(&self, rate: f64) -> PerformanceTier {
        let (good, average) = self.thresholds();
        let (is_good, is_average) = match self {
            Self::Bounce => (rate <= good, rate <= average),
            _ => (rate >= good, rate >= average),
        };
        if is_good {
            PerformanceTier::Good
        } else if is_average {
            PerformanceTier::Average
        } else {
            PerformanceTier::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub open: PerformanceTier,
    pub click: PerformanceTier,
    pub reply: PerformanceTier,
    pub bounce: PerformanceTier,
}

impl PerformanceReport {
    pub fn grade(metrics: &CampaignMetrics) -> Self {
        Self {
            open: RateKind::Open.tier(metrics.open_rate),
            click: RateKind::Click.tier(metrics.click_rate),
            reply: RateKind::Reply.tier(metrics.reply_rate),
            bounce: RateKind::Bounce.tier(metrics.bounce_rate),
        }
    }
}
