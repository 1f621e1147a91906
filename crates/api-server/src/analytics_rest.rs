//! Dashboard analytics endpoints. Every response is recomputed from the
//! delivery event log on request.

use axum::extract::{Path, Query, State};
use axum::Json;
use outreach_analytics::{
    aggregate, aggregate_unique, by_campaign, by_step, by_weekday, summarize, CampaignMetrics,
    CampaignRollup, PerformanceReport, SequenceSummary, StepMetrics, WeekdayMetrics,
};
use outreach_core::types::DeliveryEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rest::{api_error, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    /// Count each outcome at most once per message.
    #[serde(default)]
    pub unique: bool,
}

impl MetricsQuery {
    fn fold(&self, events: &[DeliveryEvent]) -> CampaignMetrics {
        if self.unique {
            aggregate_unique(events)
        } else {
            aggregate(events)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: CampaignMetrics,
    pub performance: PerformanceReport,
}

impl From<CampaignMetrics> for MetricsResponse {
    fn from(metrics: CampaignMetrics) -> Self {
        Self {
            performance: PerformanceReport::grade(&metrics),
            metrics,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OverviewResponse {
    pub sequences: usize,
    pub active_sequences: usize,
    pub enrollments: usize,
    #[serde(flatten)]
    pub totals: MetricsResponse,
}

/// GET /v1/analytics/overview
pub async fn overview(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Json<OverviewResponse> {
    let sequences = state.engine.list_sequences();
    let active_sequences = sequences
        .iter()
        .filter(|s| s.status == outreach_core::types::SequenceStatus::Active)
        .count();
    Json(OverviewResponse {
        sequences: sequences.len(),
        active_sequences,
        enrollments: state.engine.list_enrollments().len(),
        totals: query.fold(&state.engine.events()).into(),
    })
}

/// GET /v1/analytics/sequences/:id
pub async fn sequence_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<MetricsResponse> {
    state.engine.get_sequence(&id).map_err(api_error)?;
    let events = state.engine.events_for_sequence(&id);
    Ok(Json(query.fold(&events).into()))
}

/// GET /v1/analytics/campaigns
pub async fn campaign_metrics(State(state): State<AppState>) -> Json<Vec<CampaignRollup>> {
    Json(by_campaign(&state.engine.events(), &state.engine.list_sequences()))
}

/// GET /v1/analytics/sequences/:id/steps
pub async fn step_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<StepMetrics>> {
    let sequence = state.engine.get_sequence(&id).map_err(api_error)?;
    let events = state.engine.events_for_sequence(&id);
    Ok(Json(by_step(&events, &sequence)))
}

/// GET /v1/analytics/weekdays
pub async fn weekday_metrics(State(state): State<AppState>) -> Json<Vec<WeekdayMetrics>> {
    Json(by_weekday(&state.engine.events()))
}

/// GET /v1/sequences/:id/summary
pub async fn sequence_summary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<SequenceSummary> {
    let sequence = state.engine.get_sequence(&id).map_err(api_error)?;
    let enrollments = state.engine.enrollments_for_sequence(&id).map_err(api_error)?;
    let events = state.engine.events_for_sequence(&id);
    Ok(Json(summarize(&sequence, &enrollments, &events)))
}
