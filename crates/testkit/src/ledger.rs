use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use charforge_core::job::Job;
use charforge_core::ledger::{JobLedger, LedgerError, MemoryLedger};
use charforge_core::types::JobId;

/// [`MemoryLedger`] whose saves can be made to fail on demand.
#[derive(Default)]
pub struct FlakyLedger {
    inner: MemoryLedger,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobLedger for FlakyLedger {
    async fn save(&self, job: &Job) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("ledger unavailable".to_string()));
        }
        self.inner.save(job).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, LedgerError> {
        self.inner.load(id).await
    }

    async fn load_all_active(&self) -> Result<Vec<Job>, LedgerError> {
        self.inner.load_all_active().await
    }
}
