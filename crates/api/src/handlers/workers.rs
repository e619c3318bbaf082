//! Handlers for the `/workers` resource.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use charforge_core::worker::WorkerHealth;
use serde::Serialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub worker_id: String,
    pub health: WorkerHealth,
}

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: state.registry().list(),
    }))
}

/// POST /api/v1/workers/{id}/health-check
///
/// Probe the worker now instead of waiting for the monitor.
pub async fn health_check(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let health = state.registry().health_check(&worker_id).await?;
    Ok(Json(DataResponse {
        data: HealthCheckResponse { worker_id, health },
    }))
}
