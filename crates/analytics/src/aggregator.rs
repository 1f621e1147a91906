//! Outcome counting and rate calculation.

use std::collections::HashSet;

use outreach_core::types::{DeliveryEvent, Outcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Funnel metrics for any set of delivery events.
///
/// Rates are percentages of `sent`, rounded to two decimals, and 0 when
/// nothing was sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
    pub bounced: u64,
    pub unsubscribed: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub reply_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
}

impl CampaignMetrics {
    /// Adds one occurrence of `outcome`. Rates are not touched until
    /// [`CampaignMetrics::finalize`].
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Delivered => self.delivered += 1,
            Outcome::Opened => self.opened += 1,
            Outcome::Clicked => self.clicked += 1,
            Outcome::Replied => self.replied += 1,
            Outcome::Bounced => self.bounced += 1,
            Outcome::Unsubscribed => self.unsubscribed += 1,
            Outcome::Failed => self.failed += 1,
            // Never logged; only steers branch evaluation.
            Outcome::NoContactMethod => {}
        }
    }

    /// Recomputes every rate from the counts.
    pub fn finalize(mut self) -> Self {
        self.delivery_rate = rate(self.delivered, self.sent);
        self.open_rate = rate(self.opened, self.sent);
        self.click_rate = rate(self.clicked, self.sent);
        self.reply_rate = rate(self.replied, self.sent);
        self.bounce_rate = rate(self.bounced, self.sent);
        self.unsubscribe_rate = rate(self.unsubscribed, self.sent);
        self
    }

    /// Sums the counts of two metric sets and recomputes rates.
    pub fn merge(&self, other: &CampaignMetrics) -> CampaignMetrics {
        CampaignMetrics {
            sent: self.sent + other.sent,
            delivered: self.delivered + other.delivered,
            opened: self.opened + other.opened,
            clicked: self.clicked + other.clicked,
            replied: self.replied + other.replied,
            bounced: self.bounced + other.bounced,
            unsubscribed: self.unsubscribed + other.unsubscribed,
            failed: self.failed + other.failed,
            ..CampaignMetrics::default()
        }
        .finalize()
    }
}

/// `count / sent × 100`, rounded to two decimals.
pub fn rate(count: u64, sent: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    let pct = count as f64 / sent as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Counts every event by outcome.
pub fn aggregate<'a, I>(events: I) -> CampaignMetrics
where
    I: IntoIterator<Item = &'a DeliveryEvent>,
{
    let mut totals = CampaignMetrics::default();
    let mut total = 0u64;
    for event in events {
        totals.count(event.outcome);
        total += 1;
    }
    metrics::histogram!("analytics.aggregate.events").record(total as f64);
    totals.finalize()
}

/// Counts each outcome at most once per (enrollment, step), so repeated opens
/// or clicks of one message count once.
pub fn aggregate_unique<'a, I>(events: I) -> CampaignMetrics
where
    I: IntoIterator<Item = &'a DeliveryEvent>,
{
    let mut seen: HashSet<(Uuid, Uuid, Outcome)> = HashSet::new();
    let mut totals = CampaignMetrics::default();
    for event in events {
        if seen.insert((event.enrollment_id, event.step_id, event.outcome)) {
            totals.count(event.outcome);
        }
    }
    totals.finalize()
}
