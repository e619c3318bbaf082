//! PostgreSQL-backed [`JobLedger`].

use async_trait::async_trait;
use charforge_core::job::Job;
use charforge_core::ledger::{JobLedger, LedgerError};
use charforge_core::types::JobId;

use crate::models::job::JobRow;
use crate::repositories::JobRepo;
use crate::DbPool;

/// Durable ledger that stores one row per job in `render_jobs`.
#[derive(Clone)]
pub struct PgJobLedger {
    pool: DbPool,
}

impl PgJobLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn storage_error(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

#[async_trait]
impl JobLedger for PgJobLedger {
    async fn save(&self, job: &Job) -> Result<(), LedgerError> {
        let row = JobRow::from_job(job)?;
        JobRepo::upsert(&self.pool, &row).await.map_err(|e| {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist job snapshot");
            storage_error(e)
        })
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, LedgerError> {
        JobRepo::find_by_id(&self.pool, id)
            .await
            .map_err(storage_error)?
            .map(Job::try_from)
            .transpose()
    }

    async fn load_all_active(&self) -> Result<Vec<Job>, LedgerError> {
        JobRepo::list_active(&self.pool)
            .await
            .map_err(storage_error)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }
}
