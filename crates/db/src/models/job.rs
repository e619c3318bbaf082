//! Row model for the `render_jobs` table and its mapping to the domain
//! [`Job`].

use charforge_core::job::{Job, JobError, JobKind, JobStatus, RemoteArtifact};
use charforge_core::ledger::LedgerError;
use charforge_core::types::{JobId, Timestamp};
use sqlx::FromRow;

/// A row from the `render_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status_id: i16,
    pub worker_id: Option<String>,
    pub attempt_count: i32,
    pub upload_attempts: i32,
    pub remote_handle: Option<String>,
    pub submitted_at: Option<Timestamp>,
    pub next_retry_at: Option<Timestamp>,
    pub artifact: Option<serde_json::Value>,
    pub result_reference: Option<String>,
    pub last_error: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JobRow {
    /// Flatten a domain job into its row representation.
    pub fn from_job(job: &Job) -> Result<Self, LedgerError> {
        let corrupt = |reason: String| LedgerError::Corrupt { id: job.id, reason };

        Ok(Self {
            id: job.id,
            kind: job.kind.as_str().to_string(),
            payload: job.payload.clone(),
            status_id: job.status.id(),
            worker_id: job.worker_id.clone(),
            attempt_count: i32::try_from(job.attempt_count)
                .map_err(|e| corrupt(format!("attempt_count: {e}")))?,
            upload_attempts: i32::try_from(job.upload_attempts)
                .map_err(|e| corrupt(format!("upload_attempts: {e}")))?,
            remote_handle: job.remote_handle.clone(),
            submitted_at: job.submitted_at,
            next_retry_at: job.next_retry_at,
            artifact: job
                .artifact
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| corrupt(format!("artifact: {e}")))?,
            result_reference: job.result_reference.clone(),
            last_error: job
                .last_error
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| corrupt(format!("last_error: {e}")))?,
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = LedgerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| LedgerError::Corrupt { id, reason };

        let kind: JobKind = row.kind.parse().map_err(|e| corrupt(format!("{e}")))?;
        let status = JobStatus::from_id(row.status_id)
            .ok_or_else(|| corrupt(format!("unknown status_id {}", row.status_id)))?;
        let artifact: Option<RemoteArtifact> = row
            .artifact
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt(format!("artifact: {e}")))?;
        let last_error: Option<JobError> = row
            .last_error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt(format!("last_error: {e}")))?;

        Ok(Job {
            id,
            kind,
            payload: row.payload,
            status,
            worker_id: row.worker_id,
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|e| corrupt(format!("attempt_count: {e}")))?,
            upload_attempts: u32::try_from(row.upload_attempts)
                .map_err(|e| corrupt(format!("upload_attempts: {e}")))?,
            remote_handle: row.remote_handle,
            submitted_at: row.submitted_at,
            next_retry_at: row.next_retry_at,
            artifact,
            result_reference: row.result_reference,
            last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use charforge_core::job::JobErrorKind;

    use super::*;

    #[test]
    fn row_preserves_every_field() {
        let mut job = Job::new(JobKind::GenerateVideo, serde_json::json!({"prompt": "walk"}));
        job.status = JobStatus::ArtifactPending;
        job.worker_id = Some("gpu-01".into());
        job.attempt_count = 2;
        job.upload_attempts = 3;
        job.remote_handle = Some("prompt-abc".into());
        job.artifact = Some(RemoteArtifact {
            filename: "clip_00001.mp4".into(),
            subfolder: "video".into(),
            folder_type: "output".into(),
        });
        job.last_error = Some(JobError::new(JobErrorKind::Upload, "bucket quota exceeded"));

        let row = JobRow::from_job(&job).unwrap();
        assert_eq!(row.status_id, 6);
        assert_eq!(row.kind, "generate_video");

        let back = Job::try_from(row).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn unknown_status_is_reported_as_corrupt() {
        let job = Job::new(JobKind::Train, serde_json::json!({}));
        let mut row = JobRow::from_job(&job).unwrap();
        row.status_id = 99;

        let err = Job::try_from(row).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { id, .. } if id == job.id));
    }

    #[test]
    fn negative_attempt_count_is_rejected() {
        let job = Job::new(JobKind::Train, serde_json::json!({}));
        let mut row = JobRow::from_job(&job).unwrap();
        row.attempt_count = -1;
        assert!(Job::try_from(row).is_err());
    }
}
