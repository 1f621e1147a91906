//! REST handlers for sequence definitions, enrollments and health checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use outreach_channels::EmailAdapter;
use outreach_core::error::OutreachError;
use outreach_core::types::{BranchCondition, Channel, Delay, Enrollment, Sequence, Step};
use outreach_sequences::SequenceEngine;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maximum length of a sequence name.
const MAX_NAME_LEN: usize = 256;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: SequenceEngine,
    /// Maps the email provider's webhook batches onto engine outcomes.
    pub email: Arc<EmailAdapter>,
    pub node_id: String,
    pub start_time: Instant,
    /// Flipped once the scheduler loop is running.
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        engine: SequenceEngine,
        email: Arc<EmailAdapter>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            email,
            node_id: node_id.into(),
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Maps an engine error onto an HTTP status. Client errors carry their
/// message; everything else is logged and reported generically.
pub fn api_error(err: OutreachError) -> ApiError {
    let (status, code) = match &err {
        OutreachError::Validation(_) | OutreachError::MissingVariable { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "validation_failed")
        }
        OutreachError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
        OutreachError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "Request failed");
        metrics::counter!("api.errors").increment(1);
        return (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message: "Internal processing error".to_string(),
            }),
        );
    }

    warn!(error = %err, status = status.as_u16(), "Request rejected");
    metrics::counter!("api.client_errors", "code" => code).increment(1);
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: err.to_string(),
        }),
    )
}

// ─── Request bodies ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSequenceRequest {
    pub name: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

/// Attributes that can change in any sequence status.
#[derive(Debug, Deserialize)]
pub struct UpdateSequenceRequest {
    #[serde(default)]
    pub campaign_id: Option<String>,
}

/// Step payload for both insert and replace. `position` only applies to
/// inserts; omitted means append.
#[derive(Debug, Deserialize)]
pub struct StepRequest {
    pub channel: Channel,
    #[serde(default)]
    pub delay: Delay,
    #[serde(default)]
    pub subject: Option<String>,
    pub body_template: String,
    #[serde(default)]
    pub branch_conditions: Vec<BranchCondition>,
    #[serde(default)]
    pub position: Option<usize>,
}

impl StepRequest {
    fn into_step(self, id: Uuid) -> Step {
        Step {
            id,
            channel: self.channel,
            delay: self.delay,
            subject: self.subject,
            body_template: self.body_template,
            branch_conditions: self.branch_conditions,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub prospect_id: String,
    pub sequence_id: Uuid,
}

// ─── Sequences ──────────────────────────────────────────────────────────────

/// GET /v1/sequences
pub async fn list_sequences(State(state): State<AppState>) -> Json<Vec<Sequence>> {
    Json(state.engine.list_sequences())
}

/// POST /v1/sequences
pub async fn create_sequence(
    State(state): State<AppState>,
    Json(request): Json<CreateSequenceRequest>,
) -> Result<(StatusCode, Json<Sequence>), ApiError> {
    if request.name.len() > MAX_NAME_LEN {
        return Err(api_error(OutreachError::Validation(
            "sequence name exceeds maximum length".into(),
        )));
    }
    let sequence = state
        .engine
        .create_sequence(&request.name, request.campaign_id)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(sequence)))
}

/// GET /v1/sequences/:id
pub async fn get_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sequence> {
    state.engine.get_sequence(&id).map(Json).map_err(api_error)
}

/// PUT /v1/sequences/:id
pub async fn update_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSequenceRequest>,
) -> ApiResult<Sequence> {
    state
        .engine
        .set_campaign(&id, request.campaign_id)
        .map(Json)
        .map_err(api_error)
}

/// DELETE /v1/sequences/:id
pub async fn delete_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_sequence(&id).map_err(api_error)?;
    info!(sequence_id = %id, "Sequence deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/sequences/:id/steps
pub async fn add_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StepRequest>,
) -> Result<(StatusCode, Json<Sequence>), ApiError> {
    let position = request.position;
    let step = request.into_step(Uuid::new_v4());
    let sequence = state
        .engine
        .add_step(&id, step, position)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(sequence)))
}

/// PUT /v1/sequences/:id/steps/:step_id
pub async fn update_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<StepRequest>,
) -> ApiResult<Sequence> {
    state
        .engine
        .update_step(&id, request.into_step(step_id))
        .map(Json)
        .map_err(api_error)
}

/// DELETE /v1/sequences/:id/steps/:step_id
pub async fn remove_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Sequence> {
    state
        .engine
        .remove_step(&id, &step_id)
        .map(Json)
        .map_err(api_error)
}

/// POST /v1/sequences/:id/activate
pub async fn activate_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sequence> {
    state.engine.activate(&id).map(Json).map_err(api_error)
}

/// POST /v1/sequences/:id/pause
pub async fn pause_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sequence> {
    state.engine.pause(&id).map(Json).map_err(api_error)
}

/// POST /v1/sequences/:id/resume
pub async fn resume_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sequence> {
    state.engine.resume(&id).map(Json).map_err(api_error)
}

/// POST /v1/sequences/:id/archive
pub async fn archive_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sequence> {
    state.engine.archive(&id).map(Json).map_err(api_error)
}

/// POST /v1/sequences/:id/duplicate
pub async fn duplicate_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Sequence>), ApiError> {
    let copy = state.engine.duplicate(&id).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(copy)))
}

// ─── Enrollments ────────────────────────────────────────────────────────────

/// POST /v1/enrollments
pub async fn enroll(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Enrollment>), ApiError> {
    let enrollment = state
        .engine
        .enroll(&request.prospect_id, &request.sequence_id, Utc::now())
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// GET /v1/enrollments/:id
pub async fn get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Enrollment> {
    state.engine.get_enrollment(&id).map(Json).map_err(api_error)
}

/// GET /v1/sequences/:id/enrollments
pub async fn sequence_enrollments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Enrollment>> {
    state
        .engine
        .enrollments_for_sequence(&id)
        .map(Json)
        .map_err(api_error)
}

// ─── Operational ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub sequences: usize,
    pub enrollments: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        sequences: state.engine.list_sequences().len(),
        enrollments: state.engine.list_enrollments().len(),
    })
}

/// GET /ready: 200 once the scheduler loop has started.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
