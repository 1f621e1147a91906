//! Inbound provider callbacks: the generic outcome webhook plus the email
//! event batch and SMS status/inbound formats.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Form, Json};
use chrono::{DateTime, Utc};
use outreach_channels::email::{EmailCorrelation, EmailWebhookEvent};
use outreach_channels::SmsAdapter;
use outreach_core::error::OutreachError;
use outreach_core::types::{Channel, Enrollment, Outcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rest::{api_error, ApiError, ApiResult, AppState};

/// A downstream outcome reported by an adapter. Either the engine ids or the
/// provider message id identify the step.
#[derive(Debug, Deserialize)]
pub struct OutcomeReport {
    #[serde(default)]
    pub enrollment_id: Option<Uuid>,
    #[serde(default)]
    pub step_id: Option<Uuid>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WebhookBatchResponse {
    pub received: usize,
    pub recorded: usize,
    pub skipped: usize,
}

/// Twilio-style status callback, form encoded.
#[derive(Debug, Deserialize)]
pub struct SmsStatusCallback {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "MessageStatus")]
    pub message_status: String,
}

/// Twilio-style inbound message, form encoded.
#[derive(Debug, Deserialize)]
pub struct SmsInbound {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body")]
    pub body: String,
}

/// POST /v1/webhooks/outcomes
pub async fn handle_outcome(
    State(state): State<AppState>,
    Json(report): Json<OutcomeReport>,
) -> ApiResult<Enrollment> {
    let occurred_at = report.occurred_at.unwrap_or_else(Utc::now);
    let result = match (report.provider_message_id, report.enrollment_id, report.step_id) {
        (Some(provider_id), _, _) => {
            state
                .engine
                .record_provider_outcome(&provider_id, report.outcome, occurred_at)
        }
        (None, Some(enrollment_id), Some(step_id)) => {
            state
                .engine
                .record_outcome(&enrollment_id, &step_id, report.outcome, occurred_at)
        }
        _ => Err(OutreachError::Validation(
            "outcome report needs provider_message_id or enrollment_id and step_id".into(),
        )),
    };
    metrics::counter!("webhooks.outcomes_received", "outcome" => report.outcome.as_str())
        .increment(1);
    result.map(Json).map_err(api_error)
}

/// POST /v1/webhooks/email
///
/// Entries are correlated through the message id echoed from the send's
/// custom args, or through explicit engine ids. Entries that do not map to an
/// outcome or fail to record are skipped; the provider gets a 200 for the
/// batch either way.
pub async fn handle_email_webhook(
    State(state): State<AppState>,
    Json(events): Json<Vec<EmailWebhookEvent>>,
) -> Json<WebhookBatchResponse> {
    let mut response = WebhookBatchResponse {
        received: events.len(),
        ..WebhookBatchResponse::default()
    };

    for event in &events {
        let Some((correlation, outcome)) = state.email.map_webhook(event) else {
            response.skipped += 1;
            continue;
        };
        let occurred_at = DateTime::from_timestamp(event.timestamp, 0).unwrap_or_else(Utc::now);
        let recorded = match &correlation {
            EmailCorrelation::Step {
                enrollment_id,
                step_id,
            } => state
                .engine
                .record_outcome(enrollment_id, step_id, outcome, occurred_at),
            EmailCorrelation::ProviderMessage(message_id) => state
                .engine
                .record_provider_outcome(message_id, outcome, occurred_at),
        };
        match recorded {
            Ok(_) => response.recorded += 1,
            Err(e) => {
                warn!(error = %e, correlation = ?correlation, "Email webhook event rejected");
                response.skipped += 1;
            }
        }
    }

    metrics::counter!("webhooks.email_events").increment(events.len() as u64);
    debug!(
        received = response.received,
        recorded = response.recorded,
        skipped = response.skipped,
        "Email webhook batch processed"
    );
    Json(response)
}

/// POST /v1/webhooks/sms/status
pub async fn handle_sms_status(
    State(state): State<AppState>,
    Form(callback): Form<SmsStatusCallback>,
) -> Result<StatusCode, ApiError> {
    let Some(outcome) = SmsAdapter::map_status(&callback.message_status) else {
        return Ok(StatusCode::NO_CONTENT);
    };
    state
        .engine
        .record_provider_outcome(&callback.message_sid, outcome, Utc::now())
        .map_err(api_error)?;
    Ok(StatusCode::OK)
}

/// POST /v1/webhooks/sms/inbound
///
/// Attributed to the most recent SMS step dispatched to a prospect with the
/// sender's number.
pub async fn handle_sms_inbound(
    State(state): State<AppState>,
    Form(message): Form<SmsInbound>,
) -> ApiResult<Enrollment> {
    let outcome = SmsAdapter::classify_inbound(&message.body);
    let (enrollment_id, step_id) = latest_sms_dispatch(&state, &message.from).ok_or_else(|| {
        api_error(OutreachError::NotFound(format!(
            "no SMS dispatch to {}",
            message.from
        )))
    })?;

    info!(
        enrollment_id = %enrollment_id,
        outcome = outcome.as_str(),
        "Inbound SMS attributed"
    );
    state
        .engine
        .record_outcome(&enrollment_id, &step_id, outcome, Utc::now())
        .map(Json)
        .map_err(api_error)
}

fn latest_sms_dispatch(state: &AppState, from: &str) -> Option<(Uuid, Uuid)> {
    let directory = state.engine.dispatcher().directory();
    state
        .engine
        .list_enrollments()
        .into_iter()
        .filter(|e| {
            directory
                .get_prospect(&e.prospect_id)
                .and_then(|p| p.phone)
                .is_some_and(|phone| phone == from)
        })
        .filter_map(|e| {
            let (step_id, at) = e.last_dispatch?;
            let sequence = state.engine.get_sequence(&e.sequence_id).ok()?;
            let channel = sequence.step(&step_id)?.channel;
            (channel == Channel::Sms).then_some((at, e.id, step_id))
        })
        .max_by_key(|(at, _, _)| *at)
        .map(|(_, enrollment_id, step_id)| (enrollment_id, step_id))
}
