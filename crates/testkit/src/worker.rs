use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use charforge_comfyui::api::ComfyUIApiError;
use charforge_comfyui::client::{DriverError, WorkerClient};
use charforge_comfyui::history::RemoteStatus;
use charforge_core::job::{JobKind, RemoteArtifact};
use charforge_core::types::WorkerId;
use charforge_core::worker::Worker;
use serde_json::Value;

use crate::lock;

/// A recorded call to [`WorkerClient::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub worker_id: WorkerId,
    pub kind: JobKind,
    pub payload: Value,
    /// Handle returned to the caller, `None` when the submit was failed.
    pub handle: Option<String>,
}

/// Scripted [`WorkerClient`].
///
/// Submissions succeed unless a failure was queued with
/// [`fail_next_submits`](Self::fail_next_submits). Polls return queued
/// statuses first, then the default status (pending unless changed).
pub struct MockWorkerClient {
    submit_failures: Mutex<VecDeque<String>>,
    poll_script: Mutex<VecDeque<RemoteStatus>>,
    poll_default: Mutex<RemoteStatus>,
    artifact: Mutex<Result<Vec<u8>, String>>,
    unhealthy: Mutex<HashSet<WorkerId>>,
    silent_submits: AtomicBool,
    silent_fetches: AtomicBool,
    submissions: Mutex<Vec<Submission>>,
    polls: AtomicUsize,
    fetches: AtomicUsize,
    probes: AtomicUsize,
}

impl MockWorkerClient {
    pub fn new() -> Self {
        Self {
            submit_failures: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            poll_default: Mutex::new(RemoteStatus::Pending),
            artifact: Mutex::new(Ok(b"artifact-bytes".to_vec())),
            unhealthy: Mutex::new(HashSet::new()),
            silent_submits: AtomicBool::new(false),
            silent_fetches: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    /// Every job finishes on its first poll with `artifact`.
    pub fn completing_with(artifact: RemoteArtifact) -> Self {
        let client = Self::new();
        client.set_poll_default(RemoteStatus::Succeeded(artifact));
        client
    }

    /// Fail the next `count` submissions with `reason`.
    pub fn fail_next_submits(&self, count: usize, reason: &str) {
        let mut failures = lock(&self.submit_failures);
        failures.extend(std::iter::repeat(reason.to_string()).take(count));
    }

    pub fn push_poll(&self, status: RemoteStatus) {
        lock(&self.poll_script).push_back(status);
    }

    pub fn set_poll_default(&self, status: RemoteStatus) {
        *lock(&self.poll_default) = status;
    }

    pub fn set_artifact_bytes(&self, bytes: Vec<u8>) {
        *lock(&self.artifact) = Ok(bytes);
    }

    pub fn fail_fetch(&self, reason: &str) {
        *lock(&self.artifact) = Err(reason.to_string());
    }

    /// Accept submissions without ever answering.
    pub fn set_silent_submits(&self, silent: bool) {
        self.silent_submits.store(silent, Ordering::SeqCst);
    }

    /// Accept artifact downloads without ever answering.
    pub fn set_silent_fetches(&self, silent: bool) {
        self.silent_fetches.store(silent, Ordering::SeqCst);
    }

    /// Make probes against `worker_id` fail (or succeed again).
    pub fn set_unhealthy(&self, worker_id: &str, unhealthy: bool) {
        let mut set = lock(&self.unhealthy);
        if unhealthy {
            set.insert(worker_id.to_string());
        } else {
            set.remove(worker_id);
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.submissions).clone()
    }

    /// Successful submissions only.
    pub fn accepted(&self) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.handle.is_some())
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Default for MockWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(body: String) -> DriverError {
    DriverError::Api(ComfyUIApiError::Status { code: 503, body })
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn submit(
        &self,
        worker: &Worker,
        kind: JobKind,
        payload: &Value,
    ) -> Result<String, DriverError> {
        if self.silent_submits.load(Ordering::SeqCst) {
            lock(&self.submissions).push(Submission {
                worker_id: worker.id.clone(),
                kind,
                payload: payload.clone(),
                handle: None,
            });
            return std::future::pending().await;
        }
        let failure = lock(&self.submit_failures).pop_front();
        let mut submissions = lock(&self.submissions);
        let mut record = Submission {
            worker_id: worker.id.clone(),
            kind,
            payload: payload.clone(),
            handle: None,
        };

        match failure {
            Some(reason) => {
                submissions.push(record);
                Err(unavailable(reason))
            }
            None => {
                let handle = format!("prompt-{}", submissions.len() + 1);
                record.handle = Some(handle.clone());
                submissions.push(record);
                Ok(handle)
            }
        }
    }

    async fn poll(&self, _worker: &Worker, _handle: &str) -> Result<RemoteStatus, DriverError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.poll_script).pop_front();
        Ok(scripted.unwrap_or_else(|| lock(&self.poll_default).clone()))
    }

    async fn fetch_artifact(
        &self,
        _worker: &Worker,
        _artifact: &RemoteArtifact,
    ) -> Result<Vec<u8>, DriverError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.silent_fetches.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        lock(&self.artifact).clone().map_err(|body| {
            DriverError::Api(ComfyUIApiError::Status { code: 404, body })
        })
    }

    async fn probe(&self, worker: &Worker) -> Result<(), DriverError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if lock(&self.unhealthy).contains(&worker.id) {
            Err(unavailable(format!("{} unreachable", worker.id)))
        } else {
            Ok(())
        }
    }
}
