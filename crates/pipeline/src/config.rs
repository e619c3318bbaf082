use std::time::Duration;

use charforge_core::backoff::BackoffConfig;

/// Orchestrator tuning. Defaults match the documented environment defaults.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Submissions allowed per job before it fails.
    pub max_attempts: u32,
    /// Size of the job task pool.
    pub max_concurrent_jobs: usize,
    /// Interval between scheduling passes when nothing wakes the loop.
    pub schedule_interval: Duration,
    /// Delay before re-assigning a job after a counted failure.
    pub retry_backoff: BackoffConfig,
    /// Delay before re-uploading an `artifact_pending` job.
    pub upload_backoff: BackoffConfig,
    /// Automatic upload attempts before waiting for a manual retry.
    /// `None` retries forever.
    pub max_upload_attempts: Option<u32>,
    /// Limit on one pass over the storage backends.
    pub upload_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_concurrent_jobs: 16,
            schedule_interval: Duration::from_secs(1),
            retry_backoff: BackoffConfig::new(Duration::from_secs(5), Duration::from_secs(300)),
            upload_backoff: BackoffConfig::new(Duration::from_secs(10), Duration::from_secs(600)),
            max_upload_attempts: None,
            upload_timeout: Duration::from_secs(300),
        }
    }
}
