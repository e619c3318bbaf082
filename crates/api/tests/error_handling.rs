//! Tests for `AppError` → HTTP response mapping.
//!
//! These call `IntoResponse` directly on `AppError` values; no router is
//! involved.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use charforge_api::error::AppError;
use charforge_core::error::CoreError;
use charforge_core::job::{Job, JobKind, JobStatus};
use charforge_core::ledger::LedgerError;
use charforge_pipeline::{OrchestratorError, RegistryError};
use http_body_util::BodyExt;

/// Convert an `AppError` into its status code and parsed JSON body.
async fn error_to_response(err: AppError) -> (StatusCode, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

fn some_id() -> uuid::Uuid {
    Job::new(JobKind::Train, serde_json::json!({})).id
}

#[tokio::test]
async fn job_not_found_returns_404() {
    let id = some_id();
    let (status, json) = error_to_response(OrchestratorError::NotFound(id).into()).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], format!("Job with id {id} not found"));
}

#[tokio::test]
async fn validation_error_returns_400() {
    let err = OrchestratorError::Invalid(CoreError::Validation("payload must be an object".into()));

    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert_eq!(json["error"], "payload must be an object");
}

#[tokio::test]
async fn wrong_state_returns_409() {
    let err = OrchestratorError::WrongState {
        id: some_id(),
        status: JobStatus::Running,
    };

    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");
}

#[tokio::test]
async fn ledger_error_returns_500_and_sanitizes_message() {
    let err = OrchestratorError::Ledger(LedgerError::Storage("password=hunter2".into()));

    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
    assert_eq!(json["error"], "An internal error occurred");
}

#[tokio::test]
async fn unknown_worker_returns_404() {
    let err = RegistryError::NotFound("gpu-09".into());

    let (status, json) = error_to_response(err.into()).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Worker with id gpu-09 not found");
}

#[tokio::test]
async fn bad_request_error_returns_400() {
    let (status, json) = error_to_response(AppError::BadRequest("invalid field".into())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert_eq!(json["error"], "invalid field");
}
