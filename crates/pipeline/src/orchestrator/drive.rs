//! The per-job task: submit, poll, upload.

use std::ops::ControlFlow;
use std::time::Duration;

use charforge_comfyui::driver::PollOutcome;
use charforge_core::job::{Job, JobError, JobErrorKind, JobStatus};

use super::{after, JobEntry, Orchestrator};
use crate::registry::Reservation;

type Step = ControlFlow<()>;

impl Orchestrator {
    /// Drive a job until it reaches a state no task owns (waiting or
    /// terminal), its cancellation token fires, or the process shuts down.
    ///
    /// `reservation` is the worker slot for `assigning`/`running` jobs. It
    /// is dropped, and so released, as soon as the job leaves those states
    /// or the task ends.
    pub(super) async fn drive(&self, entry: &JobEntry, mut reservation: Option<Reservation>) {
        loop {
            let job = entry.state.lock().await.clone();
            if !job.status.holds_worker() {
                reservation.take();
            }
            let step = match job.status {
                JobStatus::Assigning => self.submit_step(entry, &job, &mut reservation).await,
                JobStatus::Running => self.poll_step(entry, &job, &mut reservation).await,
                JobStatus::Uploading => self.upload_step(entry, &job).await,
                _ => ControlFlow::Break(()),
            };
            if step.is_break() {
                return;
            }
        }
    }

    async fn submit_step(
        &self,
        entry: &JobEntry,
        job: &Job,
        reservation: &mut Option<Reservation>,
    ) -> Step {
        let Some(worker) = reservation.as_ref().map(|r| r.worker().clone()) else {
            let reason = "no worker reserved".to_string();
            return self
                .fail_attempt(entry, JobStatus::Assigning, JobErrorKind::Submission, reason, reservation)
                .await;
        };

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
            _ = entry.cancel.cancelled() => return ControlFlow::Break(()),
            result = self.driver.submit(&worker, job.kind, &job.payload) => result,
        };

        match result {
            Ok(handle) => {
                let now = self.clock.now();
                let committed = self
                    .transition(entry, &[JobStatus::Assigning], |next| {
                        next.status = JobStatus::Running;
                        next.remote_handle = Some(handle);
                        next.submitted_at = Some(now);
                    })
                    .await;
                match committed {
                    Ok(_) => ControlFlow::Continue(()),
                    Err(e) => {
                        self.log_commit_error(entry, "submit", &e).await;
                        ControlFlow::Break(())
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    worker_id = %worker.id,
                    attempt = job.attempt_count,
                    error = %e,
                    "Submission failed",
                );
                self.fail_attempt(
                    entry,
                    JobStatus::Assigning,
                    JobErrorKind::Submission,
                    e.to_string(),
                    reservation,
                )
                .await
            }
        }
    }

    async fn poll_step(
        &self,
        entry: &JobEntry,
        job: &Job,
        reservation: &mut Option<Reservation>,
    ) -> Step {
        let worker = reservation.as_ref().map(|r| r.worker().clone());
        let (Some(worker), Some(handle)) = (worker, job.remote_handle.clone()) else {
            let reason = "running job has no worker or remote handle".to_string();
            return self
                .fail_attempt(entry, JobStatus::Running, JobErrorKind::RemoteFailure, reason, reservation)
                .await;
        };

        let elapsed = job
            .submitted_at
            .and_then(|at| (self.clock.now() - at).to_std().ok())
            .unwrap_or(Duration::ZERO);

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
            outcome = self.driver.wait_for_completion(&worker, &handle, job.kind, elapsed, &entry.cancel) => outcome,
        };

        match outcome {
            PollOutcome::Succeeded(artifact) => {
                let committed = self
                    .transition(entry, &[JobStatus::Running], |next| {
                        next.status = JobStatus::Uploading;
                        next.artifact = Some(artifact);
                    })
                    .await;
                // The worker slot is free once the job leaves `running`.
                reservation.take();
                match committed {
                    Ok(_) => ControlFlow::Continue(()),
                    Err(e) => {
                        self.log_commit_error(entry, "poll", &e).await;
                        ControlFlow::Break(())
                    }
                }
            }
            PollOutcome::Failed(reason) => {
                tracing::warn!(
                    job_id = %job.id,
                    worker_id = %worker.id,
                    attempt = job.attempt_count,
                    reason = %reason,
                    "Remote job failed",
                );
                self.fail_attempt(entry, JobStatus::Running, JobErrorKind::RemoteFailure, reason, reservation)
                    .await
            }
            PollOutcome::TimedOut => {
                let timeout = self.driver.config().timeout_for(job.kind);
                let reason = format!("no result within {}s", timeout.as_secs());
                self.fail_attempt(entry, JobStatus::Running, JobErrorKind::Timeout, reason, reservation)
                    .await
            }
            PollOutcome::Cancelled => ControlFlow::Break(()),
        }
    }

    async fn upload_step(&self, entry: &JobEntry, job: &Job) -> Step {
        let Some(artifact) = job.artifact.clone() else {
            let reason = "no artifact recorded for upload".to_string();
            return self
                .fail_attempt(entry, JobStatus::Uploading, JobErrorKind::RemoteFailure, reason, &mut None)
                .await;
        };

        let worker = job.worker_id.as_deref().and_then(|id| self.registry.get(id));
        let Some(worker) = worker else {
            let reason = format!("worker {:?} is not registered", job.worker_id);
            return self.upload_failed(entry, job, reason).await;
        };

        let fetched = tokio::select! {
            _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
            _ = entry.cancel.cancelled() => return ControlFlow::Break(()),
            fetched = self.driver.fetch_artifact(&worker, &artifact) => fetched,
        };
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                return self
                    .upload_failed(entry, job, format!("fetching artifact from worker failed: {e}"))
                    .await;
            }
        };

        if bytes.is_empty() {
            let reason = format!("worker returned an empty artifact ({})", artifact.filename);
            return self
                .fail_attempt(entry, JobStatus::Uploading, JobErrorKind::RemoteFailure, reason, &mut None)
                .await;
        }

        let key = job.artifact_key(&artifact);
        let limit = self.config.upload_timeout;
        let stored = tokio::select! {
            _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
            _ = entry.cancel.cancelled() => return ControlFlow::Break(()),
            stored = tokio::time::timeout(limit, self.store.store(&key, &bytes)) => stored,
        };

        match stored {
            Err(_) => {
                let reason = format!("storage upload did not finish within {}s", limit.as_secs());
                self.upload_failed(entry, job, reason).await
            }
            Ok(Ok(stored)) => {
                let committed = self
                    .transition(entry, &[JobStatus::Uploading], |next| {
                        next.status = JobStatus::Succeeded;
                        next.result_reference = Some(stored.location);
                        next.upload_attempts += 1;
                        next.next_retry_at = None;
                    })
                    .await;
                if let Err(e) = committed {
                    self.log_commit_error(entry, "upload", &e).await;
                }
                ControlFlow::Break(())
            }
            Ok(Err(e)) => self.upload_failed(entry, job, e.to_string()).await,
        }
    }

    /// Record a failure that consumes the attempt budget: `retry_wait` while
    /// attempts remain, `failed` after.
    pub(super) async fn fail_attempt(
        &self,
        entry: &JobEntry,
        from: JobStatus,
        kind: JobErrorKind,
        message: String,
        reservation: &mut Option<Reservation>,
    ) -> Step {
        debug_assert!(kind.consumes_attempt(), "{kind:?} must not end an attempt");
        let now = self.clock.now();
        let max_attempts = self.config.max_attempts;
        let backoff = self.config.retry_backoff;

        let committed = self
            .transition(entry, &[from], |next| {
                next.last_error = Some(JobError { kind, message, at: now });
                next.worker_id = None;
                next.remote_handle = None;
                next.submitted_at = None;
                next.artifact = None;
                if next.attempt_count >= max_attempts {
                    next.status = JobStatus::Failed;
                    next.next_retry_at = None;
                } else {
                    next.status = JobStatus::RetryWait;
                    let delay = backoff.delay_for_attempt(next.attempt_count);
                    next.next_retry_at = Some(after(now, delay));
                }
            })
            .await;
        reservation.take();

        match committed {
            Ok(job) if job.status == JobStatus::Failed => {
                tracing::error!(
                    job_id = %job.id,
                    attempts = job.attempt_count,
                    error_kind = ?kind,
                    "Job failed, attempt budget exhausted",
                );
            }
            Ok(job) => {
                tracing::info!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    retry_at = ?job.next_retry_at,
                    "Job will be retried",
                );
            }
            Err(e) => self.log_commit_error(entry, "fail", &e).await,
        }
        ControlFlow::Break(())
    }

    /// Record a storage failure: the job waits in `artifact_pending` and
    /// keeps its attempt count.
    async fn upload_failed(&self, entry: &JobEntry, job: &Job, reason: String) -> Step {
        let now = self.clock.now();
        let backoff = self.config.upload_backoff;
        let cap = self.config.max_upload_attempts;

        tracing::warn!(
            job_id = %job.id,
            upload_attempt = job.upload_attempts + 1,
            error = %reason,
            "Artifact upload failed",
        );

        let committed = self
            .transition(entry, &[JobStatus::Uploading], |next| {
                next.status = JobStatus::ArtifactPending;
                next.upload_attempts += 1;
                next.next_retry_at = Some(after(now, backoff.delay_for_attempt(next.upload_attempts)));
                next.last_error = Some(JobError {
                    kind: JobErrorKind::Upload,
                    message: reason,
                    at: now,
                });
            })
            .await;

        match committed {
            Ok(job) if cap.is_some_and(|cap| job.upload_attempts >= cap) => {
                tracing::warn!(
                    job_id = %job.id,
                    upload_attempts = job.upload_attempts,
                    "Automatic upload retries exhausted, waiting for a manual retry",
                );
            }
            Ok(_) => {}
            Err(e) => self.log_commit_error(entry, "upload", &e).await,
        }
        ControlFlow::Break(())
    }
}
