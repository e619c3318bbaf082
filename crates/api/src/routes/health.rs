use axum::extract::State;
use axum::{routing::get, Json, Router};
use charforge_core::worker::WorkerHealth;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the database is unreachable.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the database is reachable; `null` on the in-memory ledger.
    pub db_healthy: Option<bool>,
    pub workers_total: usize,
    pub workers_healthy: usize,
}

/// GET /health -- returns service, database and worker pool health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = match &state.db {
        Some(pool) => Some(charforge_db::health_check(pool).await.is_ok()),
        None => None,
    };

    let workers = state.registry().list();
    let workers_healthy = workers
        .iter()
        .filter(|w| w.health == WorkerHealth::Healthy)
        .count();

    let status = if db_healthy == Some(false) { "degraded" } else { "ok" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        workers_total: workers.len(),
        workers_healthy,
    })
}

/// Mount health check routes (root level, not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
