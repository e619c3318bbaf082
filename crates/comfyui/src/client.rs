//! The seam between the orchestrator and a remote worker.
//!
//! [`WorkerClient`] is the only way the rest of the system talks to a GPU
//! worker. [`ComfyUIWorkerClient`] implements it over the ComfyUI HTTP API;
//! tests substitute scripted doubles.

use std::time::Duration;

use async_trait::async_trait;
use charforge_core::job::{JobKind, RemoteArtifact};
use charforge_core::worker::Worker;
use serde_json::Value;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history, RemoteStatus};
use crate::workflow;

/// Default timeout for a single liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations a remote worker supports.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Submit one unit of work. Returns the worker's handle for it.
    async fn submit(&self, worker: &Worker, kind: JobKind, payload: &Value)
        -> Result<String, DriverError>;

    /// Ask the worker for the current state of a submitted job.
    async fn poll(&self, worker: &Worker, handle: &str) -> Result<RemoteStatus, DriverError>;

    /// Download the output file of a finished job.
    async fn fetch_artifact(
        &self,
        worker: &Worker,
        artifact: &RemoteArtifact,
    ) -> Result<Vec<u8>, DriverError>;

    /// Liveness probe. `Ok` means the worker is able to accept work.
    async fn probe(&self, worker: &Worker) -> Result<(), DriverError>;
}

/// Errors raised while talking to a worker.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Transport failure or non-2xx answer from the worker.
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// The worker did not answer within the allowed time.
    #[error("Worker did not respond within {0:?}")]
    Timeout(Duration),

    /// The job payload cannot be turned into a workflow.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The worker answered with something unusable.
    #[error("Unexpected worker response: {0}")]
    Protocol(String),
}

/// [`WorkerClient`] over the ComfyUI HTTP API.
pub struct ComfyUIWorkerClient {
    http: reqwest::Client,
    client_id: String,
    probe_timeout: Duration,
}

impl ComfyUIWorkerClient {
    pub fn new(probe_timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), probe_timeout)
    }

    /// Reuse an existing [`reqwest::Client`] for every worker.
    pub fn with_client(http: reqwest::Client, probe_timeout: Duration) -> Self {
        Self {
            http,
            client_id: uuid::Uuid::new_v4().to_string(),
            probe_timeout,
        }
    }

    fn api(&self, worker: &Worker) -> ComfyUIApi {
        ComfyUIApi::new(self.http.clone(), &worker.base_url)
    }
}

impl Default for ComfyUIWorkerClient {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl WorkerClient for ComfyUIWorkerClient {
    async fn submit(
        &self,
        worker: &Worker,
        kind: JobKind,
        payload: &Value,
    ) -> Result<String, DriverError> {
        let workflow = workflow::build(kind, payload)?;
        let response = self
            .api(worker)
            .queue_prompt(&workflow, &self.client_id)
            .await?;

        if response.prompt_id.is_empty() {
            return Err(DriverError::Protocol(
                "empty prompt_id in /prompt response".to_string(),
            ));
        }

        tracing::debug!(
            worker_id = %worker.id,
            kind = %kind,
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow queued on worker",
        );
        Ok(response.prompt_id)
    }

    async fn poll(&self, worker: &Worker, handle: &str) -> Result<RemoteStatus, DriverError> {
        let history = self.api(worker).history(handle).await?;
        Ok(parse_history(handle, &history))
    }

    async fn fetch_artifact(
        &self,
        worker: &Worker,
        artifact: &RemoteArtifact,
    ) -> Result<Vec<u8>, DriverError> {
        let bytes = self
            .api(worker)
            .view(artifact)
            .await?;
        Ok(bytes)
    }

    async fn probe(&self, worker: &Worker) -> Result<(), DriverError> {
        let api = self.api(worker);
        match tokio::time::timeout(self.probe_timeout, api.system_stats()).await {
            Ok(result) => result.map(|_| ()).map_err(DriverError::from),
            Err(_) => Err(DriverError::Timeout(self.probe_timeout)),
        }
    }
}
