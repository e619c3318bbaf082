use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use charforge_core::error::CoreError;
use charforge_pipeline::{OrchestratorError, RegistryError};
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce consistent JSON error responses of
/// the form `{ "error": message, "code": CODE }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `charforge_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An error from the job orchestrator.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// An error from the worker registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core_error(core),

            AppError::Orchestrator(err) => match err {
                OrchestratorError::NotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("Job with id {id} not found"),
                ),
                OrchestratorError::Invalid(core) => classify_core_error(core),
                OrchestratorError::WrongState { .. } => {
                    (StatusCode::CONFLICT, "CONFLICT", err.to_string())
                }
                OrchestratorError::Ledger(e) => {
                    tracing::error!(error = %e, "Ledger error");
                    internal()
                }
            },

            AppError::Registry(err) => match err {
                RegistryError::NotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("Worker with id {id} not found"),
                ),
                RegistryError::Invalid(core) => classify_core_error(core),
                RegistryError::Unavailable(_) | RegistryError::Saturated(_) => {
                    (StatusCode::CONFLICT, "CONFLICT", err.to_string())
                }
            },

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(core: &CoreError) -> (StatusCode, &'static str, String) {
    match core {
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            internal()
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
