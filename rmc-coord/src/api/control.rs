//! Control API: start, resume, decide, abort, inspect
//!
//! Thin handlers over [`SessionController`](crate::session::SessionController).
//! Starting anything while a worker holds the session lock yields 409.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rmc_common::events::QualityAction;
use rmc_common::{QualityResult, RemeasurePair};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::rta::RtaOutcome;
use crate::workers::{ProcessingMode, WorkerSnapshot};
use crate::AppState;

/// POST /sweep/start request
#[derive(Debug, Deserialize)]
pub struct StartSweepRequest {
    pub channels: Vec<String>,
    pub num_positions: u32,
}

/// POST /sweep/repeat request
#[derive(Debug, Default, Deserialize)]
pub struct RepeatRequest {
    #[serde(default)]
    pub pairs: Option<Vec<RemeasurePair>>,
}

/// POST /processing/start request
#[derive(Debug, Deserialize)]
pub struct StartProcessingRequest {
    pub channels: Vec<String>,
    #[serde(default)]
    pub mode: ProcessingMode,
}

/// POST /session/decision request
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub action: QualityAction,
}

/// POST /verify/rta request
#[derive(Debug, Deserialize)]
pub struct VerifyRtaRequest {
    pub channel: String,
    pub position: u32,
}

#[derive(Debug, Serialize)]
pub struct SessionStarted {
    pub session_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    /// False when no worker was running
    pub aborted: bool,
}

/// POST /sweep/start
pub async fn start_sweep(
    State(state): State<AppState>,
    Json(request): Json<StartSweepRequest>,
) -> ApiResult<(StatusCode, Json<SessionStarted>)> {
    let session_id = state
        .session
        .start_sweep(request.channels, request.num_positions)?;
    Ok((StatusCode::ACCEPTED, Json(SessionStarted { session_id })))
}

/// POST /sweep/repeat
pub async fn start_repeat(
    State(state): State<AppState>,
    request: Option<Json<RepeatRequest>>,
) -> ApiResult<(StatusCode, Json<SessionStarted>)> {
    let pairs = request.and_then(|Json(request)| request.pairs);
    let session_id = state.session.start_repeat(pairs).await?;
    Ok((StatusCode::ACCEPTED, Json(SessionStarted { session_id })))
}

/// POST /processing/start
pub async fn start_processing(
    State(state): State<AppState>,
    Json(request): Json<StartProcessingRequest>,
) -> ApiResult<(StatusCode, Json<SessionStarted>)> {
    let session_id = state
        .session
        .start_processing(request.channels, request.mode)?;
    Ok((StatusCode::ACCEPTED, Json(SessionStarted { session_id })))
}

/// POST /session/resume
pub async fn resume(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.session.resume().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /session/decision
pub async fn submit_decision(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<StatusCode> {
    state.session.submit_decision(request.action).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /session/abort
pub async fn abort(State(state): State<AppState>) -> Json<AbortResponse> {
    let aborted = state.session.abort().await;
    Json(AbortResponse { aborted })
}

/// GET /session
pub async fn get_session(State(state): State<AppState>) -> Json<WorkerSnapshot> {
    Json(state.session.snapshot())
}

/// GET /qualities
pub async fn get_qualities(State(state): State<AppState>) -> Json<Vec<QualityResult>> {
    Json(state.session.qualities().snapshot().await)
}

/// GET /qualities/retakes
pub async fn get_retakes(State(state): State<AppState>) -> Json<Vec<RemeasurePair>> {
    Json(state.session.qualities().retake_candidates().await)
}

/// POST /verify/rta
///
/// Runs the whole verification window before responding.
pub async fn verify_rta(
    State(state): State<AppState>,
    Json(request): Json<VerifyRtaRequest>,
) -> ApiResult<Json<RtaOutcome>> {
    let outcome = state
        .session
        .verify_rta(&request.channel, request.position)
        .await?;
    Ok(Json(outcome))
}

/// Build control routes
pub fn control_routes() -> Router<AppState> {
    Router::new()
        .route("/sweep/start", post(start_sweep))
        .route("/sweep/repeat", post(start_repeat))
        .route("/processing/start", post(start_processing))
        .route("/session", get(get_session))
        .route("/session/resume", post(resume))
        .route("/session/decision", post(submit_decision))
        .route("/session/abort", post(abort))
        .route("/qualities", get(get_qualities))
        .route("/qualities/retakes", get(get_retakes))
        .route("/verify/rta", post(verify_rta))
}
