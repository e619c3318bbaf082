//! Repository for the `render_jobs` table.
//!
//! The orchestrator always writes a complete snapshot, so there is a single
//! upsert instead of per-field update statements.

use charforge_core::job::JobStatus;
use charforge_core::types::JobId;
use sqlx::PgPool;

use crate::models::job::JobRow;

/// Column list for `render_jobs` queries.
const COLUMNS: &str = "\
    id, kind, payload, status_id, worker_id, \
    attempt_count, upload_attempts, remote_handle, \
    submitted_at, next_retry_at, artifact, result_reference, last_error, \
    created_at, updated_at";

/// Terminal statuses: succeeded, failed, cancelled.
const TERMINAL_STATUSES: [i16; 3] = [
    JobStatus::Succeeded as i16,
    JobStatus::Failed as i16,
    JobStatus::Cancelled as i16,
];

/// Provides persistence for render job snapshots.
pub struct JobRepo;

impl JobRepo {
    /// Insert a job row, or overwrite every mutable column if it exists.
    pub async fn upsert(pool: &PgPool, row: &JobRow) -> Result<(), sqlx::Error> {
        let query = format!(
            "INSERT INTO render_jobs ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (id) DO UPDATE SET \
                 status_id = EXCLUDED.status_id, \
                 worker_id = EXCLUDED.worker_id, \
                 attempt_count = EXCLUDED.attempt_count, \
                 upload_attempts = EXCLUDED.upload_attempts, \
                 remote_handle = EXCLUDED.remote_handle, \
                 submitted_at = EXCLUDED.submitted_at, \
                 next_retry_at = EXCLUDED.next_retry_at, \
                 artifact = EXCLUDED.artifact, \
                 result_reference = EXCLUDED.result_reference, \
                 last_error = EXCLUDED.last_error, \
                 updated_at = EXCLUDED.updated_at"
        );
        sqlx::query(&query)
            .bind(row.id)
            .bind(&row.kind)
            .bind(&row.payload)
            .bind(row.status_id)
            .bind(&row.worker_id)
            .bind(row.attempt_count)
            .bind(row.upload_attempts)
            .bind(&row.remote_handle)
            .bind(row.submitted_at)
            .bind(row.next_retry_at)
            .bind(&row.artifact)
            .bind(&row.result_reference)
            .bind(&row.last_error)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Find a job by its id.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM render_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All non-terminal jobs, oldest first.
    pub async fn list_active(pool: &PgPool) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM render_jobs \
             WHERE status_id <> ALL($1) \
             ORDER BY created_at ASC, id ASC"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&TERMINAL_STATUSES[..])
            .fetch_all(pool)
            .await
    }
}
