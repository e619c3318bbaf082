//! The job orchestrator.
//!
//! Owns every job's state machine. Intake calls ([`Orchestrator::submit_job`],
//! [`Orchestrator::cancel`], ...) change state directly; everything else
//! happens in the scheduling loop ([`Orchestrator::run`]) and in one task per
//! active job, bounded by a fixed-size pool.
//!
//! Every transition is validated, saved to the ledger, and only then applied
//! in memory, all while holding that job's lock.

mod drive;
mod error;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use charforge_comfyui::driver::RemoteJobDriver;
use charforge_core::error::CoreError;
use charforge_core::job::{validate_payload, Job, JobError, JobErrorKind, JobKind, JobStatus};
use charforge_core::ledger::JobLedger;
use charforge_core::scheduling::validate_transition;
use charforge_core::types::{JobId, Timestamp};
use charforge_storage::ArtifactStore;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::registry::{Reservation, WorkerRegistry};

pub(crate) use error::CommitError;
pub use error::OrchestratorError;

/// Result of [`Orchestrator::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The job had already finished with this status.
    AlreadyTerminal(JobStatus),
}

/// In-memory handle on one job.
struct JobEntry {
    /// Intake order, used to break `created_at` ties.
    seq: u64,
    state: Mutex<Job>,
    /// Fired by [`Orchestrator::cancel`] to stop this job's task.
    cancel: CancellationToken,
    /// A task is currently driving the job.
    active: AtomicBool,
    /// An operator asked for an upload retry.
    manual_upload: AtomicBool,
}

impl JobEntry {
    fn new(seq: u64, job: Job) -> Self {
        Self {
            seq,
            state: Mutex::new(job),
            cancel: CancellationToken::new(),
            active: AtomicBool::new(false),
            manual_upload: AtomicBool::new(false),
        }
    }

    fn try_claim(self: &Arc<Self>) -> Option<ActiveClaim> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ActiveClaim(self.clone()))
    }
}

/// Marks a job as driven by a task until dropped.
struct ActiveClaim(Arc<JobEntry>);

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::SeqCst);
    }
}

/// What the scheduler will do with a job this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Reserve a worker and submit.
    Assign,
    /// Fetch the artifact and store it.
    Upload,
    /// Re-take the worker slot of a job that was running before a restart.
    Adopt,
    /// Submission outcome unknown (restart while assigning).
    RecoverAssigning,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    ledger: Arc<dyn JobLedger>,
    registry: Arc<WorkerRegistry>,
    driver: Arc<RemoteJobDriver>,
    store: ArtifactStore,
    clock: Clock,
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    next_seq: AtomicU64,
    pool: Arc<Semaphore>,
    wake: Notify,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ledger: Arc<dyn JobLedger>,
        registry: Arc<WorkerRegistry>,
        driver: Arc<RemoteJobDriver>,
        store: ArtifactStore,
    ) -> Arc<Self> {
        let pool = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Arc::new(Self {
            config,
            ledger,
            registry,
            driver,
            store,
            clock: Clock::start(),
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            pool,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Create a queued job and return its id.
    pub async fn submit_job(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<JobId, OrchestratorError> {
        validate_payload(&payload)?;
        self.driver
            .check_payload(kind, &payload)
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let now = self.clock.now();
        let mut job = Job::new(kind, payload);
        job.created_at = now;
        job.updated_at = now;

        self.ledger.save(&job).await?;

        let id = job.id;
        self.insert(job).await;
        tracing::info!(job_id = %id, kind = %kind, "Job submitted");
        self.wake.notify_one();
        Ok(id)
    }

    /// Current snapshot of a job. Jobs finished before the last restart are
    /// read from the ledger.
    pub async fn get_status(&self, id: JobId) -> Result<Job, OrchestratorError> {
        if let Some(entry) = self.entry(id).await {
            return Ok(entry.state.lock().await.clone());
        }
        self.ledger
            .load(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Every job known to this process, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for entry in self.entries().await {
            let job = entry.state.lock().await.clone();
            jobs.push((job.created_at, entry.seq, job));
        }
        jobs.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        jobs.into_iter().map(|(_, _, job)| job).collect()
    }

    /// Cancel a job.
    ///
    /// Waiting jobs are cancelled at once. A job with a live task is marked
    /// cancelled and its task stops at its next suspension point; the
    /// remote worker is not asked to abort.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, OrchestratorError> {
        let Some(entry) = self.entry(id).await else {
            return match self.ledger.load(id).await? {
                Some(job) if job.is_terminal() => Ok(CancelOutcome::AlreadyTerminal(job.status)),
                _ => Err(OrchestratorError::NotFound(id)),
            };
        };

        let mut state = entry.state.lock().await;
        if state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(state.status));
        }

        let now = self.clock.now();
        let mut next = state.clone();
        next.status = JobStatus::Cancelled;
        next.next_retry_at = None;
        next.last_error = Some(JobError {
            kind: JobErrorKind::Cancelled,
            message: "cancelled by request".to_string(),
            at: now,
        });
        next.updated_at = now;
        validate_transition(state.status, next.status)
            .map_err(CoreError::Internal)?;

        self.ledger.save(&next).await?;
        let from = state.status;
        *state = next;
        drop(state);

        entry.cancel.cancel();
        tracing::info!(job_id = %id, from = %from, "Job cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Ask for an immediate upload attempt of an `artifact_pending` job,
    /// bypassing its backoff and the automatic attempt cap.
    pub async fn retry_upload(&self, id: JobId) -> Result<Job, OrchestratorError> {
        let Some(entry) = self.entry(id).await else {
            return match self.ledger.load(id).await? {
                Some(job) => Err(OrchestratorError::WrongState {
                    id,
                    status: job.status,
                }),
                None => Err(OrchestratorError::NotFound(id)),
            };
        };

        let job = entry.state.lock().await.clone();
        if job.status != JobStatus::ArtifactPending {
            return Err(OrchestratorError::WrongState {
                id,
                status: job.status,
            });
        }

        entry.manual_upload.store(true, Ordering::SeqCst);
        tracing::info!(job_id = %id, upload_attempts = job.upload_attempts, "Upload retry requested");
        self.wake.notify_one();
        Ok(job)
    }

    /// Load every non-terminal job from the ledger. Call once at startup,
    /// before [`run`](Self::run).
    ///
    /// Jobs are picked up by the scheduler according to their status:
    /// waiting jobs as usual, `assigning` jobs as failed submissions,
    /// `running` jobs by re-taking their worker slot and polling again,
    /// `uploading` jobs by re-running the upload.
    pub async fn resume(&self) -> Result<usize, OrchestratorError> {
        let active = self.ledger.load_all_active().await?;
        let mut resumed = 0;
        for job in active {
            if self.entry(job.id).await.is_some() {
                continue;
            }
            tracing::info!(
                job_id = %job.id,
                status = %job.status,
                attempt = job.attempt_count,
                worker_id = ?job.worker_id,
                "Resuming job from ledger",
            );
            self.insert(job).await;
            resumed += 1;
        }
        self.wake.notify_one();
        Ok(resumed)
    }

    // -----------------------------------------------------------------------
    // Scheduling loop
    // -----------------------------------------------------------------------

    /// Run the scheduling loop until [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.schedule_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.schedule_interval.as_millis() as u64,
            pool_size = self.config.max_concurrent_jobs,
            "Job scheduler started",
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Job scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.schedule_once().await;
        }
    }

    /// One scheduling pass over every job that needs attention.
    ///
    /// Jobs are taken in creation order. Once a job finds no worker for its
    /// capability, younger jobs needing that capability are skipped for the
    /// rest of the pass.
    pub async fn schedule_once(self: &Arc<Self>) {
        let now = self.clock.now();
        let mut candidates = Vec::new();

        for entry in self.entries().await {
            if entry.active.load(Ordering::SeqCst) {
                continue;
            }
            let job = entry.state.lock().await;
            if let Some(action) = self.action_for(&entry, &job, now) {
                candidates.push((job.created_at, entry.seq, job.kind, action, entry.clone()));
            }
        }
        candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut blocked = HashSet::new();
        for (_, _, kind, action, entry) in candidates {
            if action == Action::RecoverAssigning {
                self.recover_assigning(&entry).await;
                continue;
            }

            let capability = kind.required_capability();
            if action == Action::Assign && blocked.contains(&capability) {
                continue;
            }

            let Ok(permit) = self.pool.clone().try_acquire_owned() else {
                tracing::debug!("Job pool is full, deferring remaining jobs");
                break;
            };

            match action {
                Action::Assign => {
                    let Some(worker) = self.registry.reserve_for(capability) else {
                        blocked.insert(capability);
                        continue;
                    };
                    let reservation = Reservation::new(self.registry.clone(), worker);
                    self.start_assignment(entry, reservation, permit).await;
                }
                Action::Upload => self.start_upload(entry, permit).await,
                Action::Adopt => self.start_adopted(entry, permit).await,
                Action::RecoverAssigning => {}
            }
        }
    }

    /// Stop the scheduler and every job task, leaving job statuses as they
    /// are. Returns `false` if tasks were still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tasks.close();
        tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok()
    }

    fn action_for(&self, entry: &JobEntry, job: &Job, now: Timestamp) -> Option<Action> {
        match job.status {
            JobStatus::Queued => Some(Action::Assign),
            JobStatus::RetryWait if job.is_due(now) => Some(Action::Assign),
            JobStatus::ArtifactPending => {
                let manual = entry.manual_upload.load(Ordering::SeqCst);
                let under_cap = self
                    .config
                    .max_upload_attempts
                    .map_or(true, |cap| job.upload_attempts < cap);
                (manual || (under_cap && job.is_due(now))).then_some(Action::Upload)
            }
            // No task is driving these: they were loaded from the ledger or
            // their task stopped before the job left the state.
            JobStatus::Assigning => Some(Action::RecoverAssigning),
            JobStatus::Running => Some(Action::Adopt),
            JobStatus::Uploading => Some(Action::Upload),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Task start-up
    // -----------------------------------------------------------------------

    async fn start_assignment(
        self: &Arc<Self>,
        entry: Arc<JobEntry>,
        reservation: Reservation,
        permit: OwnedSemaphorePermit,
    ) {
        let Some(claim) = entry.try_claim() else {
            return;
        };
        let worker_id = reservation.worker().id.clone();

        let committed = self
            .transition(&entry, &[JobStatus::Queued, JobStatus::RetryWait], |job| {
                job.status = JobStatus::Assigning;
                job.worker_id = Some(worker_id);
                job.attempt_count += 1;
                job.remote_handle = None;
                job.submitted_at = None;
                job.next_retry_at = None;
                job.artifact = None;
            })
            .await;

        if let Err(e) = committed {
            self.log_commit_error(&entry, "assign", &e).await;
            return;
        }
        self.spawn_drive(entry, claim, Some(reservation), permit);
    }

    async fn start_upload(self: &Arc<Self>, entry: Arc<JobEntry>, permit: OwnedSemaphorePermit) {
        let Some(claim) = entry.try_claim() else {
            return;
        };

        let status = entry.state.lock().await.status;
        if status == JobStatus::ArtifactPending {
            let committed = self
                .transition(&entry, &[JobStatus::ArtifactPending], |job| {
                    job.status = JobStatus::Uploading;
                    job.next_retry_at = None;
                })
                .await;
            if let Err(e) = committed {
                self.log_commit_error(&entry, "upload", &e).await;
                return;
            }
            // A requested retry stays pending until the upload is under way.
            entry.manual_upload.store(false, Ordering::SeqCst);
        }
        self.spawn_drive(entry, claim, None, permit);
    }

    async fn start_adopted(self: &Arc<Self>, entry: Arc<JobEntry>, permit: OwnedSemaphorePermit) {
        let Some(claim) = entry.try_claim() else {
            return;
        };

        let worker_id = entry.state.lock().await.worker_id.clone();
        let adopted = match worker_id.as_deref() {
            Some(id) => self.registry.adopt(id).map_err(|e| e.to_string()),
            None => Err("running job has no worker".to_string()),
        };

        match adopted {
            Ok(worker) => {
                let reservation = Reservation::new(self.registry.clone(), worker);
                self.spawn_drive(entry, claim, Some(reservation), permit);
            }
            Err(reason) => {
                let _ = self
                    .fail_attempt(
                        &entry,
                        JobStatus::Running,
                        JobErrorKind::RemoteFailure,
                        reason,
                        &mut None,
                    )
                    .await;
            }
        }
    }

    async fn recover_assigning(&self, entry: &Arc<JobEntry>) {
        let Some(_claim) = entry.try_claim() else {
            return;
        };
        let _ = self
            .fail_attempt(
                entry,
                JobStatus::Assigning,
                JobErrorKind::Submission,
                "submission outcome unknown after restart".to_string(),
                &mut None,
            )
            .await;
    }

    fn spawn_drive(
        self: &Arc<Self>,
        entry: Arc<JobEntry>,
        claim: ActiveClaim,
        reservation: Option<Reservation>,
        permit: OwnedSemaphorePermit,
    ) {
        let this = self.clone();
        self.tasks.spawn(async move {
            this.drive(&entry, reservation).await;
            drop(claim);
            drop(permit);
            this.wake.notify_one();
        });
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Validate, persist, then apply a transition.
    ///
    /// `from` lists the statuses the caller expects the job to be in; if the
    /// job has moved on (for example it was cancelled) nothing is written.
    async fn transition<F>(
        &self,
        entry: &JobEntry,
        from: &[JobStatus],
        update: F,
    ) -> Result<Job, CommitError>
    where
        F: FnOnce(&mut Job),
    {
        let mut state = entry.state.lock().await;
        let current = state.status;
        if !from.contains(&current) {
            return Err(CommitError::Stale(current));
        }

        let mut next = state.clone();
        update(&mut next);
        validate_transition(current, next.status).map_err(CommitError::Invalid)?;
        next.updated_at = self.clock.now();

        self.ledger.save(&next).await?;

        tracing::info!(
            job_id = %next.id,
            from = %current,
            to = %next.status,
            attempt = next.attempt_count,
            worker_id = ?next.worker_id,
            "Job transition",
        );
        *state = next.clone();
        Ok(next)
    }

    async fn log_commit_error(&self, entry: &JobEntry, step: &str, error: &CommitError) {
        let job_id = entry.state.lock().await.id;
        match error {
            CommitError::Stale(status) => {
                tracing::debug!(job_id = %job_id, step, status = %status, "Job changed underneath, skipping");
            }
            CommitError::Invalid(reason) => {
                tracing::error!(job_id = %job_id, step, reason = %reason, "Rejected job transition");
            }
            CommitError::Ledger(e) => {
                tracing::error!(job_id = %job_id, step, error = %e, "Ledger write failed, job left unchanged");
            }
        }
    }

    async fn insert(&self, job: Job) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = job.id;
        self.jobs
            .write()
            .await
            .insert(id, Arc::new(JobEntry::new(seq, job)));
    }

    async fn entry(&self, id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs.read().await.get(&id).cloned()
    }

    async fn entries(&self) -> Vec<Arc<JobEntry>> {
        self.jobs.read().await.values().cloned().collect()
    }
}

/// `now + delay`, saturating at the latest representable time.
fn after(now: Timestamp, delay: Duration) -> Timestamp {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(Timestamp::MAX_UTC)
}
