use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use charforge_comfyui::driver::{DriverConfig, RemoteJobDriver};
use charforge_comfyui::history::RemoteStatus;
use charforge_core::job::{Job, JobErrorKind, JobKind, JobStatus, RemoteArtifact};
use charforge_core::ledger::{JobLedger, MemoryLedger};
use charforge_core::types::JobId;
use charforge_core::worker::{Capability, WorkerSpec};
use charforge_pipeline::{
    CancelOutcome, Orchestrator, OrchestratorConfig, OrchestratorError, RegistryConfig,
    WorkerRegistry,
};
use charforge_storage::{ArtifactStore, StorageBackend};
use charforge_testkit::{FlakyLedger, MemoryBackend, MockWorkerClient};
use chrono::Utc;
use serde_json::json;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Setup {
    client: MockWorkerClient,
    workers: Vec<WorkerSpec>,
    config: OrchestratorConfig,
    driver: DriverConfig,
    ledger: Arc<dyn JobLedger>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            client: MockWorkerClient::completing_with(artifact()),
            workers: vec![worker("gpu-01", Capability::Image)],
            config: OrchestratorConfig::default(),
            driver: DriverConfig::default(),
            ledger: Arc::new(MemoryLedger::new()),
        }
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<WorkerRegistry>,
    client: Arc<MockWorkerClient>,
    primary: Arc<MemoryBackend>,
    fallback: Arc<MemoryBackend>,
}

impl Harness {
    async fn build(setup: Setup) -> Self {
        let client = Arc::new(setup.client);
        let registry = Arc::new(WorkerRegistry::new(client.clone(), RegistryConfig::default()));
        for spec in setup.workers {
            registry.register(spec).unwrap();
        }
        registry.check_all().await;

        let primary = Arc::new(MemoryBackend::new("primary"));
        let fallback = Arc::new(MemoryBackend::new("fallback"));
        let backends: Vec<Arc<dyn StorageBackend>> = vec![primary.clone(), fallback.clone()];

        let driver = Arc::new(RemoteJobDriver::new(client.clone(), setup.driver));
        let orchestrator = Orchestrator::new(
            setup.config,
            setup.ledger,
            registry.clone(),
            driver,
            ArtifactStore::new(backends),
        );

        Self {
            orchestrator,
            registry,
            client,
            primary,
            fallback,
        }
    }

    async fn start(setup: Setup) -> Self {
        let harness = Self::build(setup).await;
        tokio::spawn(harness.orchestrator.clone().run());
        harness
    }

    async fn submit(&self, kind: JobKind) -> JobId {
        self.orchestrator
            .submit_job(kind, json!({"workflow": {"1": {"class_type": "KSampler"}}}))
            .await
            .unwrap()
    }

    async fn job(&self, id: JobId) -> Job {
        self.orchestrator.get_status(id).await.unwrap()
    }

    fn load(&self, worker_id: &str) -> u32 {
        self.registry.get(worker_id).unwrap().load
    }

    /// Poll the job every 500ms of (paused) time until `done` holds.
    async fn wait_for(&self, id: JobId, what: &str, done: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..20_000 {
            let job = self.job(id).await;
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("job {id} never became {what}: {:?}", self.job(id).await);
    }

    async fn wait_for_status(&self, id: JobId, status: JobStatus) -> Job {
        self.wait_for(id, status.as_str(), |job| job.status == status).await
    }
}

fn worker(id: &str, capability: Capability) -> WorkerSpec {
    WorkerSpec::new(id, format!("http://{id}:8188"), vec![capability])
}

fn artifact() -> RemoteArtifact {
    RemoteArtifact {
        filename: "out.png".into(),
        subfolder: String::new(),
        folder_type: "output".into(),
    }
}

fn pending_client() -> MockWorkerClient {
    let client = MockWorkerClient::new();
    client.set_poll_default(RemoteStatus::Pending);
    client
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn image_job_runs_to_success() {
    let h = Harness::start(Setup::default()).await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;

    let key = format!("images/{id}/out.png");
    assert_eq!(job.result_reference, Some(format!("memory://primary/{key}")));
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.upload_attempts, 1);
    assert_eq!(job.worker_id.as_deref(), Some("gpu-01"));
    assert_eq!(
        h.primary.get(&key),
        Some((b"artifact-bytes".to_vec(), "image/png".to_string()))
    );
    assert!(h.fallback.keys().is_empty());
    assert_eq!(h.client.accepted().len(), 1);
    assert_eq!(h.load("gpu-01"), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_payload_is_rejected_at_intake() {
    let h = Harness::build(Setup::default()).await;

    let result = h.orchestrator.submit_job(JobKind::GenerateImage, json!([1, 2])).await;

    assert_matches!(result, Err(OrchestratorError::Invalid(_)));
    assert!(h.orchestrator.list_jobs().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unusable_generation_request_is_rejected_at_intake() {
    let h = Harness::build(Setup::default()).await;

    let no_character = h
        .orchestrator
        .submit_job(JobKind::GenerateImage, json!({"prompt": "a portrait"}))
        .await;
    let train_without_graph = h
        .orchestrator
        .submit_job(JobKind::Train, json!({"character_id": 7}))
        .await;

    assert_matches!(no_character, Err(OrchestratorError::Invalid(_)));
    assert_matches!(train_without_graph, Err(OrchestratorError::Invalid(_)));
    assert!(h.orchestrator.list_jobs().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn character_request_is_submitted_to_a_worker() {
    let h = Harness::start(Setup::default()).await;
    let payload = json!({
        "character": {"trigger_word": "ohwx_mira", "lora_name": "mira.safetensors"},
        "prompt": "a portrait",
        "seed": 11,
    });

    let id = h
        .orchestrator
        .submit_job(JobKind::GenerateImage, payload.clone())
        .await
        .unwrap();
    h.wait_for_status(id, JobStatus::Succeeded).await;

    assert_eq!(h.client.submissions()[0].payload, payload);
}

#[tokio::test(start_paused = true)]
async fn unknown_job_is_not_found() {
    let h = Harness::build(Setup::default()).await;
    let id = Job::new(JobKind::GenerateImage, json!({})).id;

    assert_matches!(h.orchestrator.get_status(id).await, Err(OrchestratorError::NotFound(_)));
    assert_matches!(h.orchestrator.cancel(id).await, Err(OrchestratorError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn submission_failures_are_retried_until_a_submit_succeeds() {
    let client = pending_client();
    client.fail_next_submits(2, "connection refused");
    let h = Harness::start(Setup {
        client,
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Running).await;

    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.remote_handle.as_deref(), Some("prompt-3"));
    assert_eq!(h.client.submissions().len(), 3);
    assert_eq!(h.client.accepted().len(), 1);
    assert_eq!(h.load("gpu-01"), 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_exhaust_the_attempt_budget() {
    let h = Harness::start(Setup {
        client: pending_client(),
        driver: DriverConfig {
            image_timeout: Duration::from_secs(30),
            ..DriverConfig::default()
        },
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Failed).await;

    assert_eq!(job.attempt_count, 3);
    let error = job.last_error.expect("failed job records its error");
    assert_eq!(error.kind, JobErrorKind::Timeout);
    assert_eq!(job.worker_id, None);
    assert_eq!(h.client.accepted().len(), 3);
    assert_eq!(h.load("gpu-01"), 0);
}

#[tokio::test(start_paused = true)]
async fn remote_failure_moves_to_retry_wait_and_releases_the_worker() {
    let client = pending_client();
    client.push_poll(RemoteStatus::Failed("CUDA out of memory".into()));
    let h = Harness::start(Setup {
        client,
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h
        .wait_for(id, "retried", |job| {
            job.status == JobStatus::RetryWait || job.attempt_count == 2
        })
        .await;

    let error = job.last_error.expect("retry records the failure");
    assert_eq!(error.kind, JobErrorKind::RemoteFailure);
    assert_eq!(error.message, "CUDA out of memory");

    let job = h.wait_for_status(id, JobStatus::Running).await;
    assert_eq!(job.attempt_count, 2);
    assert_eq!(h.load("gpu-01"), 1);
}

// ---------------------------------------------------------------------------
// Upload fallback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn upload_falls_back_to_the_next_backend() {
    let h = Harness::start(Setup::default()).await;
    h.primary.set_failing(true);

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;

    assert_eq!(
        job.result_reference,
        Some(format!("memory://fallback/images/{id}/out.png"))
    );
    assert_eq!(h.primary.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_uploads_wait_then_retry_without_resubmitting() {
    let h = Harness::start(Setup::default()).await;
    h.primary.set_failing(true);
    h.fallback.set_failing(true);

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::ArtifactPending).await;

    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.upload_attempts, 1);
    assert_eq!(job.last_error.map(|e| e.kind), Some(JobErrorKind::Upload));
    assert!(job.artifact.is_some());
    assert!(job.next_retry_at.is_some());
    assert_eq!(h.load("gpu-01"), 0);

    h.primary.set_failing(false);
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;

    assert_eq!(job.attempt_count, 1);
    assert!(job.upload_attempts >= 2);
    assert_eq!(
        job.result_reference,
        Some(format!("memory://primary/images/{id}/out.png"))
    );
    assert_eq!(h.client.accepted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn capped_uploads_wait_for_a_manual_retry() {
    let h = Harness::start(Setup {
        config: OrchestratorConfig {
            max_upload_attempts: Some(1),
            ..OrchestratorConfig::default()
        },
        ..Setup::default()
    })
    .await;
    h.primary.set_failing(true);
    h.fallback.set_failing(true);

    let id = h.submit(JobKind::GenerateImage).await;
    h.wait_for_status(id, JobStatus::ArtifactPending).await;

    tokio::time::sleep(Duration::from_secs(3600)).await;
    let job = h.job(id).await;
    assert_eq!(job.status, JobStatus::ArtifactPending);
    assert_eq!(job.upload_attempts, 1);

    h.primary.set_failing(false);
    let requested = h.orchestrator.retry_upload(id).await.unwrap();
    assert_eq!(requested.status, JobStatus::ArtifactPending);

    let job = h.wait_for_status(id, JobStatus::Succeeded).await;
    assert_eq!(job.upload_attempts, 2);
    assert_eq!(h.client.accepted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn requested_upload_retry_survives_a_ledger_outage() {
    let ledger = Arc::new(FlakyLedger::new());
    let h = Harness::start(Setup {
        config: OrchestratorConfig {
            max_upload_attempts: Some(1),
            ..OrchestratorConfig::default()
        },
        ledger: ledger.clone(),
        ..Setup::default()
    })
    .await;
    h.primary.set_failing(true);
    h.fallback.set_failing(true);

    let id = h.submit(JobKind::GenerateImage).await;
    h.wait_for_status(id, JobStatus::ArtifactPending).await;

    h.primary.set_failing(false);
    ledger.set_failing(true);
    h.orchestrator.retry_upload(id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    let job = h.job(id).await;
    assert_eq!(job.status, JobStatus::ArtifactPending);
    assert_eq!(job.upload_attempts, 1);

    ledger.set_failing(false);
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;
    assert_eq!(job.upload_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_upload_requires_artifact_pending() {
    let h = Harness::start(Setup::default()).await;

    let id = h.submit(JobKind::GenerateImage).await;
    h.wait_for_status(id, JobStatus::Succeeded).await;

    assert_matches!(
        h.orchestrator.retry_upload(id).await,
        Err(OrchestratorError::WrongState {
            status: JobStatus::Succeeded,
            ..
        })
    );
}

#[tokio::test(start_paused = true)]
async fn empty_artifact_counts_as_a_remote_failure() {
    let client = MockWorkerClient::completing_with(artifact());
    client.set_artifact_bytes(Vec::new());
    let h = Harness::start(Setup {
        client,
        config: OrchestratorConfig {
            max_attempts: 1,
            ..OrchestratorConfig::default()
        },
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Failed).await;

    assert_eq!(job.last_error.map(|e| e.kind), Some(JobErrorKind::RemoteFailure));
    assert!(h.primary.keys().is_empty());
}

// ---------------------------------------------------------------------------
// Unresponsive peers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_submit_counts_against_the_attempt_budget() {
    let client = pending_client();
    client.set_silent_submits(true);
    let h = Harness::start(Setup {
        client,
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Failed).await;

    assert_eq!(job.attempt_count, 3);
    let error = job.last_error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Submission);
    assert!(error.message.contains("30s"), "{}", error.message);
    assert_eq!(h.client.submissions().len(), 3);
    assert_eq!(h.load("gpu-01"), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_artifact_download_leaves_the_job_pending_upload() {
    let h = Harness::start(Setup::default()).await;
    h.client.set_silent_fetches(true);

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::ArtifactPending).await;

    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.last_error.map(|e| e.kind), Some(JobErrorKind::Upload));
    assert_eq!(h.load("gpu-01"), 0);

    h.client.set_silent_fetches(false);
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;
    assert_eq!(job.attempt_count, 1);
    assert_eq!(h.client.accepted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_storage_backend_leaves_the_job_pending_upload() {
    let h = Harness::start(Setup {
        config: OrchestratorConfig {
            upload_timeout: Duration::from_secs(20),
            ..OrchestratorConfig::default()
        },
        ..Setup::default()
    })
    .await;
    h.primary.set_silent(true);

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::ArtifactPending).await;

    let error = job.last_error.unwrap();
    assert_eq!(error.kind, JobErrorKind::Upload);
    assert!(error.message.contains("20s"), "{}", error.message);
    assert_eq!(job.upload_attempts, 1);

    h.primary.set_silent(false);
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;
    assert_eq!(
        job.result_reference,
        Some(format!("memory://primary/images/{id}/out.png"))
    );
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn jobs_are_assigned_in_submission_order() {
    let h = Harness::build(Setup {
        workers: vec![
            worker("img", Capability::Image),
            worker("train", Capability::Training),
        ],
        ..Setup::default()
    })
    .await;

    let first = h.submit(JobKind::GenerateImage).await;
    let second = h.submit(JobKind::GenerateImage).await;
    let training = h.submit(JobKind::Train).await;

    h.orchestrator.schedule_once().await;

    assert_eq!(h.job(first).await.worker_id.as_deref(), Some("img"));
    assert_eq!(h.job(second).await.status, JobStatus::Queued);
    // A blocked image job does not hold back other capabilities.
    assert_eq!(h.job(training).await.worker_id.as_deref(), Some("train"));

    h.wait_for_status(first, JobStatus::Succeeded).await;
    assert_eq!(h.job(second).await.status, JobStatus::Queued);

    h.orchestrator.schedule_once().await;
    assert_eq!(h.job(second).await.worker_id.as_deref(), Some("img"));
    h.wait_for_status(second, JobStatus::Succeeded).await;
}

#[tokio::test(start_paused = true)]
async fn job_pool_bounds_concurrent_jobs() {
    let h = Harness::build(Setup {
        client: pending_client(),
        workers: vec![worker("a", Capability::Image), worker("b", Capability::Image)],
        config: OrchestratorConfig {
            max_concurrent_jobs: 1,
            ..OrchestratorConfig::default()
        },
        ..Setup::default()
    })
    .await;

    let first = h.submit(JobKind::GenerateImage).await;
    let second = h.submit(JobKind::GenerateImage).await;

    h.orchestrator.schedule_once().await;

    assert_ne!(h.job(first).await.status, JobStatus::Queued);
    assert_eq!(h.job(second).await.status, JobStatus::Queued);
    assert_eq!(h.load("a") + h.load("b"), 1);
}

#[tokio::test(start_paused = true)]
async fn worker_load_never_exceeds_slots() {
    let h = Harness::start(Setup {
        client: pending_client(),
        workers: vec![
            worker("a", Capability::Image),
            worker("b", Capability::Image).with_slots(2),
        ],
        ..Setup::default()
    })
    .await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.submit(JobKind::GenerateImage).await);
    }
    h.wait_for_status(ids[2], JobStatus::Running).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let jobs = h.orchestrator.list_jobs().await;
    let running = jobs.iter().filter(|j| j.status == JobStatus::Running).count();
    let queued = jobs.iter().filter(|j| j.status == JobStatus::Queued).count();
    assert_eq!(running, 3);
    assert_eq!(queued, 2);
    assert_eq!(h.load("a"), 1);
    assert_eq!(h.load("b"), 2);
    // Oldest jobs were served first.
    for id in &ids[..3] {
        assert_eq!(h.job(*id).await.status, JobStatus::Running);
    }
}

#[tokio::test(start_paused = true)]
async fn unhealthy_workers_are_not_assigned() {
    let client = MockWorkerClient::completing_with(artifact());
    client.set_unhealthy("gpu-01", true);
    let h = Harness::build(Setup {
        client,
        ..Setup::default()
    })
    .await;
    // Two failed probes mark the worker unreachable.
    h.registry.check_all().await;

    let id = h.submit(JobKind::GenerateImage).await;
    h.orchestrator.schedule_once().await;

    assert_eq!(h.job(id).await.status, JobStatus::Queued);
    assert!(h.client.submissions().is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_queued_job() {
    let h = Harness::build(Setup {
        workers: Vec::new(),
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateVideo).await;

    assert_eq!(h.orchestrator.cancel(id).await.unwrap(), CancelOutcome::Cancelled);
    let job = h.job(id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.last_error.map(|e| e.kind), Some(JobErrorKind::Cancelled));

    assert_eq!(
        h.orchestrator.cancel(id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobStatus::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_running_job_stops_polling_and_frees_the_worker() {
    let h = Harness::start(Setup {
        client: pending_client(),
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    h.wait_for_status(id, JobStatus::Running).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.client.poll_count() > 0);

    assert_eq!(h.orchestrator.cancel(id).await.unwrap(), CancelOutcome::Cancelled);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.load("gpu-01"), 0);
    let polls = h.client.poll_count();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.client.poll_count(), polls);
    assert_eq!(h.job(id).await.status, JobStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_finished_job_reports_terminal_status() {
    let h = Harness::start(Setup::default()).await;

    let id = h.submit(JobKind::GenerateImage).await;
    h.wait_for_status(id, JobStatus::Succeeded).await;

    assert_eq!(
        h.orchestrator.cancel(id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobStatus::Succeeded)
    );
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ledger_failure_leaves_the_job_unchanged() {
    let ledger = Arc::new(FlakyLedger::new());
    let h = Harness::build(Setup {
        ledger: ledger.clone(),
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    ledger.set_failing(true);

    h.orchestrator.schedule_once().await;

    let job = h.job(id).await;
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(h.load("gpu-01"), 0);
    assert!(h.client.submissions().is_empty());

    let rejected = h
        .orchestrator
        .submit_job(JobKind::Train, json!({"workflow": {"1": {"class_type": "KSampler"}}}))
        .await;
    assert_matches!(rejected, Err(OrchestratorError::Ledger(_)));
    assert_eq!(h.orchestrator.list_jobs().await.len(), 1);

    ledger.set_failing(false);
    h.orchestrator.schedule_once().await;
    h.wait_for_status(id, JobStatus::Succeeded).await;
}

#[tokio::test(start_paused = true)]
async fn every_transition_is_persisted() {
    let ledger = Arc::new(MemoryLedger::new());
    let h = Harness::start(Setup {
        ledger: ledger.clone(),
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    let job = h.wait_for_status(id, JobStatus::Succeeded).await;

    assert_eq!(ledger.load(id).await.unwrap(), Some(job));
    assert!(ledger.load_all_active().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resume_continues_jobs_from_the_ledger() {
    let now = Utc::now();

    let mut running = Job::new(JobKind::GenerateImage, json!({}));
    running.status = JobStatus::Running;
    running.worker_id = Some("gpu-01".into());
    running.attempt_count = 1;
    running.remote_handle = Some("prompt-41".into());
    running.submitted_at = Some(now);

    let mut assigning = Job::new(JobKind::GenerateImage, json!({}));
    assigning.status = JobStatus::Assigning;
    assigning.worker_id = Some("gpu-01".into());
    assigning.attempt_count = 1;

    let mut pending = Job::new(JobKind::GenerateImage, json!({}));
    pending.status = JobStatus::ArtifactPending;
    pending.worker_id = Some("gpu-01".into());
    pending.attempt_count = 1;
    pending.upload_attempts = 1;
    pending.artifact = Some(artifact());

    let mut done = Job::new(JobKind::GenerateImage, json!({}));
    done.status = JobStatus::Succeeded;

    let ids = (running.id, assigning.id, pending.id);
    let ledger = Arc::new(MemoryLedger::with_jobs([running, assigning, pending, done]));
    let h = Harness::build(Setup {
        ledger,
        workers: vec![worker("gpu-01", Capability::Image).with_slots(4)],
        ..Setup::default()
    })
    .await;

    assert_eq!(h.orchestrator.resume().await.unwrap(), 3);
    tokio::spawn(h.orchestrator.clone().run());

    let running = h.wait_for_status(ids.0, JobStatus::Succeeded).await;
    assert_eq!(running.attempt_count, 1);

    let assigning = h.wait_for_status(ids.1, JobStatus::Succeeded).await;
    assert_eq!(assigning.attempt_count, 2);

    let pending = h.wait_for_status(ids.2, JobStatus::Succeeded).await;
    assert_eq!(pending.attempt_count, 1);
    assert_eq!(pending.upload_attempts, 2);

    // Only the job whose submission outcome was unknown is submitted again.
    assert_eq!(h.client.accepted().len(), 1);
    assert_eq!(h.load("gpu-01"), 0);
}

#[tokio::test(start_paused = true)]
async fn resumed_job_on_unknown_worker_is_retried() {
    let mut running = Job::new(JobKind::GenerateImage, json!({}));
    running.status = JobStatus::Running;
    running.worker_id = Some("gone".into());
    running.attempt_count = 1;
    running.remote_handle = Some("prompt-7".into());
    running.submitted_at = Some(Utc::now());
    let id = running.id;

    let h = Harness::build(Setup {
        ledger: Arc::new(MemoryLedger::with_jobs([running])),
        ..Setup::default()
    })
    .await;
    h.orchestrator.resume().await.unwrap();
    tokio::spawn(h.orchestrator.clone().run());

    let job = h.wait_for_status(id, JobStatus::Succeeded).await;
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.worker_id.as_deref(), Some("gpu-01"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_statuses_in_place() {
    let h = Harness::start(Setup {
        client: pending_client(),
        ..Setup::default()
    })
    .await;

    let id = h.submit(JobKind::GenerateImage).await;
    h.wait_for_status(id, JobStatus::Running).await;

    assert!(h.orchestrator.shutdown(Duration::from_secs(5)).await);
    assert_eq!(h.job(id).await.status, JobStatus::Running);
    assert_eq!(h.load("gpu-01"), 0);
}
