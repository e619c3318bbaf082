//! Drives one remote job from submission to a terminal outcome.
//!
//! Submission is a single best-effort call. Polling repeats on an
//! exponential backoff until the worker reports a terminal state, the
//! per-kind wall-clock timeout passes, or the job's cancellation token
//! fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use charforge_core::backoff::{next_delay, BackoffConfig};
use charforge_core::job::{JobKind, RemoteArtifact};
use charforge_core::worker::Worker;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{DriverError, WorkerClient};
use crate::history::RemoteStatus;
use crate::workflow;

/// Poll schedule, per-kind wall-clock limits and per-call limits.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub poll: BackoffConfig,
    pub train_timeout: Duration,
    pub image_timeout: Duration,
    pub video_timeout: Duration,
    /// Limit on one `/prompt` or `/history` call.
    pub request_timeout: Duration,
    /// Limit on downloading an output file.
    pub fetch_timeout: Duration,
}

impl DriverConfig {
    pub fn timeout_for(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Train => self.train_timeout,
            JobKind::GenerateImage => self.image_timeout,
            JobKind::GenerateVideo => self.video_timeout,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll: BackoffConfig::default(),
            train_timeout: Duration::from_secs(2 * 60 * 60),
            image_timeout: Duration::from_secs(10 * 60),
            video_timeout: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// Terminal result of [`RemoteJobDriver::wait_for_completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded(RemoteArtifact),
    Failed(String),
    /// The per-kind timeout elapsed before a terminal state was seen.
    TimedOut,
    /// The job's cancellation token fired.
    Cancelled,
}

pub struct RemoteJobDriver {
    client: Arc<dyn WorkerClient>,
    config: DriverConfig,
}

impl RemoteJobDriver {
    pub fn new(client: Arc<dyn WorkerClient>, config: DriverConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Reject a payload no worker could turn into a workflow.
    pub fn check_payload(&self, kind: JobKind, payload: &Value) -> Result<(), DriverError> {
        workflow::parse(kind, payload).map(|_| ())
    }

    /// Submit a job to `worker`. Any error, including no answer within
    /// `request_timeout`, is a submission failure.
    pub async fn submit(
        &self,
        worker: &Worker,
        kind: JobKind,
        payload: &Value,
    ) -> Result<String, DriverError> {
        bounded(self.config.request_timeout, self.client.submit(worker, kind, payload)).await
    }

    /// One poll bounded by `request_timeout`, without backoff.
    pub async fn poll(&self, worker: &Worker, handle: &str) -> Result<RemoteStatus, DriverError> {
        bounded(self.config.request_timeout, self.client.poll(worker, handle)).await
    }

    pub async fn fetch_artifact(
        &self,
        worker: &Worker,
        artifact: &RemoteArtifact,
    ) -> Result<Vec<u8>, DriverError> {
        bounded(self.config.fetch_timeout, self.client.fetch_artifact(worker, artifact)).await
    }

    /// Poll `handle` on `worker` until it reaches a terminal outcome.
    ///
    /// `already_elapsed` is the time since the job was submitted, so a poll
    /// loop resumed after a restart only gets the time that is left.
    /// Transport errors count as still pending.
    pub async fn wait_for_completion(
        &self,
        worker: &Worker,
        handle: &str,
        kind: JobKind,
        already_elapsed: Duration,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let timeout = self.config.timeout_for(kind);
        let deadline = Instant::now() + timeout.saturating_sub(already_elapsed);

        let mut delay = self.config.poll.initial_delay;
        let mut polls = 0u32;

        loop {
            let wake = (Instant::now() + delay).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    worker_id = %worker.id,
                    handle,
                    polls,
                    timeout_secs = timeout.as_secs(),
                    "Remote job timed out",
                );
                return PollOutcome::TimedOut;
            }

            polls += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => continue,
                result = self.poll(worker, handle) => result,
            };

            match result {
                Ok(RemoteStatus::Succeeded(artifact)) => return PollOutcome::Succeeded(artifact),
                Ok(RemoteStatus::Failed(reason)) => return PollOutcome::Failed(reason),
                Ok(RemoteStatus::Pending) => {}
                Err(e) => {
                    tracing::debug!(
                        worker_id = %worker.id,
                        handle,
                        error = %e,
                        "Poll failed, treating as pending",
                    );
                }
            }

            delay = next_delay(delay, &self.config.poll);
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(DriverError::Timeout(limit)))
}
