//! Durable job ledger contract.
//!
//! The orchestrator is the only writer. It calls [`JobLedger::save`] on
//! every transition and only applies the transition in memory once the save
//! returned `Ok`. [`JobLedger::load_all_active`] is called once at startup
//! to resume in-flight jobs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::job::Job;
use crate::types::JobId;

#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Persist a full job snapshot, replacing any previous one.
    async fn save(&self, job: &Job) -> Result<(), LedgerError>;

    /// Load a single job snapshot.
    async fn load(&self, id: JobId) -> Result<Option<Job>, LedgerError>;

    /// Every non-terminal job, oldest first.
    async fn load_all_active(&self) -> Result<Vec<Job>, LedgerError>;
}

/// Errors surfaced by a ledger implementation.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The backing store rejected or failed the operation.
    #[error("Ledger storage error: {0}")]
    Storage(String),

    /// A stored record could not be mapped back into a [`Job`].
    #[error("Corrupt ledger record for job {id}: {reason}")]
    Corrupt { id: JobId, reason: String },
}

/// Process-local ledger.
///
/// Used when no database is configured and in tests. Jobs do not survive
/// a restart.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the ledger with existing snapshots (e.g. to simulate a restart).
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|job| (job.id, job)).collect()),
        }
    }

    /// Number of stored snapshots, terminal ones included.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn save(&self, job: &Job) -> Result<(), LedgerError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, LedgerError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn load_all_active(&self) -> Result<Vec<Job>, LedgerError> {
        let mut active: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|job| (job.created_at, job.id));
        Ok(active)
    }
}
