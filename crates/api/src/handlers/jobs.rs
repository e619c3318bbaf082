//! Handlers for the `/jobs` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use charforge_core::job::{JobKind, JobStatus};
use charforge_core::types::JobId;
use charforge_pipeline::CancelOutcome;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: JobKind,
    /// Opaque workflow payload forwarded to the worker. Must be an object.
    pub payload: serde_json::Value,
}

/// Result of a cancel request.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// `cancelled` or `already_terminal`.
    pub outcome: &'static str,
    pub status: JobStatus,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Queue a new job. Returns 202 with the queued job; progress is observed
/// through `GET /api/v1/jobs/{id}`.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJobRequest>,
) -> AppResult<impl IntoResponse> {
    let id = state.orchestrator.submit_job(input.kind, input.payload).await?;
    let job = state.orchestrator.get_status(id).await?;

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let jobs = state.orchestrator.list_jobs().await;
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.get_status(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancelling a finished job is not an error; the response reports the
/// status it finished with.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let data = match state.orchestrator.cancel(job_id).await? {
        CancelOutcome::Cancelled => CancelResponse {
            outcome: "cancelled",
            status: JobStatus::Cancelled,
        },
        CancelOutcome::AlreadyTerminal(status) => CancelResponse {
            outcome: "already_terminal",
            status,
        },
    };
    Ok(Json(DataResponse { data }))
}

/// POST /api/v1/jobs/{id}/retry-upload
///
/// Only valid for jobs in `artifact_pending`; anything else is 409.
pub async fn retry_upload(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.retry_upload(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}
