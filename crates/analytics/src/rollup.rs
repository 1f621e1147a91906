//! Groupings of the event log for the dashboard views: per sequence, per
//! campaign, per step, and per weekday of send.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Utc, Weekday};
use outreach_core::types::{Channel, DeliveryEvent, Outcome, Sequence};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::{aggregate, CampaignMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRollup {
    /// `None` groups sequences that belong to no campaign.
    pub campaign_id: Option<String>,
    pub sequence_ids: Vec<Uuid>,
    pub metrics: CampaignMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_id: Uuid,
    pub position: usize,
    pub channel: Channel,
    pub subject: Option<String>,
    pub metrics: CampaignMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekdayMetrics {
    pub weekday: Weekday,
    pub metrics: CampaignMetrics,
}

/// Metrics per sequence id, for every sequence that has events.
pub fn by_sequence(events: &[DeliveryEvent]) -> BTreeMap<Uuid, CampaignMetrics> {
    let mut grouped: BTreeMap<Uuid, Vec<&DeliveryEvent>> = BTreeMap::new();
    for event in events {
        grouped.entry(event.sequence_id).or_default().push(event);
    }
    grouped
        .into_iter()
        .map(|(id, events)| (id, aggregate(events)))
        .collect()
}

/// Metrics per campaign. Every known sequence appears in exactly one
/// rollup, even without events. Events of unknown sequences are ignored.
pub fn by_campaign(events: &[DeliveryEvent], sequences: &[Sequence]) -> Vec<CampaignRollup> {
    let campaign_of: HashMap<Uuid, Option<String>> = sequences
        .iter()
        .map(|s| (s.id, s.campaign_id.clone()))
        .collect();

    let mut groups: BTreeMap<Option<String>, (Vec<Uuid>, Vec<&DeliveryEvent>)> = BTreeMap::new();
    for sequence in sequences {
        groups
            .entry(sequence.campaign_id.clone())
            .or_default()
            .0
            .push(sequence.id);
    }
    for event in events {
        if let Some(campaign) = campaign_of.get(&event.sequence_id) {
            groups.entry(campaign.clone()).or_default().1.push(event);
        }
    }

    debug!(campaigns = groups.len(), "Campaign rollup computed");
    groups
        .into_iter()
        .map(|(campaign_id, (sequence_ids, events))| CampaignRollup {
            campaign_id,
            sequence_ids,
            metrics: aggregate(events),
        })
        .collect()
}

/// Metrics per step of `sequence`, in step order.
pub fn by_step(events: &[DeliveryEvent], sequence: &Sequence) -> Vec<StepMetrics> {
    let mut grouped: HashMap<Uuid, Vec<&DeliveryEvent>> = HashMap::new();
    for event in events.iter().filter(|e| e.sequence_id == sequence.id) {
        grouped.entry(event.step_id).or_default().push(event);
    }
    sequence
        .steps
        .iter()
        .enumerate()
        .map(|(position, step)| StepMetrics {
            step_id: step.id,
            position,
            channel: step.channel,
            subject: step.subject.clone(),
            metrics: aggregate(grouped.remove(&step.id).unwrap_or_default()),
        })
        .collect()
}

/// Metrics per weekday the message was sent on, Monday first.
///
/// Downstream outcomes are attributed to the weekday of the `sent` event of
/// the same (enrollment, step). Events with no matching send fall back to
/// their own timestamp.
pub fn by_weekday(events: &[DeliveryEvent]) -> Vec<WeekdayMetrics> {
    let mut sent_at: HashMap<(Uuid, Uuid), DateTime<Utc>> = HashMap::new();
    for event in events.iter().filter(|e| e.outcome == Outcome::Sent) {
        // Earliest send wins so the result does not depend on event order.
        sent_at
            .entry((event.enrollment_id, event.step_id))
            .and_modify(|at| *at = (*at).min(event.occurred_at))
            .or_insert(event.occurred_at);
    }

    let mut buckets: [Vec<&DeliveryEvent>; 7] = Default::default();
    for event in events {
        let weekday = sent_at
            .get(&(event.enrollment_id, event.step_id))
            .unwrap_or(&event.occurred_at)
            .weekday();
        buckets[weekday.num_days_from_monday() as usize].push(event);
    }

    let mut weekday = Weekday::Mon;
    let mut out = Vec::with_capacity(7);
    for bucket in buckets {
        out.push(WeekdayMetrics {
            weekday,
            metrics: aggregate(bucket),
        });
        weekday = weekday.succ();
    }
    out
}
