pub mod health;
pub mod jobs;
pub mod workers;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /jobs                          list, submit
/// /jobs/{id}                     get
/// /jobs/{id}/cancel              cancel (POST)
/// /jobs/{id}/retry-upload        retry upload (POST)
///
/// /workers                       registry snapshot
/// /workers/{id}/health-check     probe now (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/workers", workers::router())
}
