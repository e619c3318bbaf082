//! The `Job` entity and its vocabulary: kinds, statuses and errors.
//!
//! A job is owned by the orchestrator; the ledger only mirrors snapshots of
//! it. Every field needed to resume the job after a restart (retry timing,
//! remote handle, artifact location) lives on the entity itself.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp, WorkerId};
use crate::worker::Capability;

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// What a job asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Train a per-character LoRA adapter.
    Train,
    /// Render a still image.
    GenerateImage,
    /// Render a video clip.
    GenerateVideo,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [Self::Train, Self::GenerateImage, Self::GenerateVideo];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::GenerateImage => "generate_image",
            Self::GenerateVideo => "generate_video",
        }
    }

    /// The worker capability a job of this kind needs.
    pub fn required_capability(self) -> Capability {
        match self {
            Self::Train => Capability::Training,
            Self::GenerateImage => Capability::Image,
            Self::GenerateVideo => Capability::Video,
        }
    }

    /// Top-level storage prefix for artifacts of this kind.
    pub fn storage_prefix(self) -> &'static str {
        match self {
            Self::Train => "loras",
            Self::GenerateImage => "images",
            Self::GenerateVideo => "videos",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Job lifecycle status.
///
/// Discriminants match the seed data of the `job_statuses` lookup table.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued = 1,
    Assigning = 2,
    Running = 3,
    Uploading = 4,
    RetryWait = 5,
    ArtifactPending = 6,
    Succeeded = 7,
    Failed = 8,
    Cancelled = 9,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        Self::Queued,
        Self::Assigning,
        Self::Running,
        Self::Uploading,
        Self::RetryWait,
        Self::ArtifactPending,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Return the database status ID.
    pub fn id(self) -> i16 {
        self as i16
    }

    /// Inverse of [`id`](Self::id).
    pub fn from_id(id: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigning => "assigning",
            Self::Running => "running",
            Self::Uploading => "uploading",
            Self::RetryWait => "retry_wait",
            Self::ArtifactPending => "artifact_pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `succeeded`, `failed` and `cancelled` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Statuses during which the job holds a reservation on its worker.
    pub fn holds_worker(self) -> bool {
        matches!(self, Self::Assigning | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors recorded on the job
// ---------------------------------------------------------------------------

/// Classification of a failure recorded in [`Job::last_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The work could not be handed off to the worker.
    Submission,
    /// The worker executed the work and reported a failure.
    RemoteFailure,
    /// No terminal result arrived before the per-kind deadline.
    Timeout,
    /// The artifact was produced but could not be stored durably.
    Upload,
    /// The job was cancelled by a user.
    Cancelled,
}

impl JobErrorKind {
    /// Errors that consume the job's attempt budget.
    pub fn consumes_attempt(self) -> bool {
        matches!(self, Self::Submission | Self::RemoteFailure | Self::Timeout)
    }
}

/// Structured error stored on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub at: Timestamp,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Where a worker left the output of a job.
///
/// Mirrors the ComfyUI `/view` addressing (`filename`, `subfolder`, `type`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtifact {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of requested work tracked end-to-end by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Opaque input (character reference, prompt, workflow graph).
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub worker_id: Option<WorkerId>,
    /// Number of submissions so far. Never decreases.
    pub attempt_count: u32,
    /// Number of artifact upload attempts, independent of `attempt_count`.
    pub upload_attempts: u32,
    /// Handle returned by the worker for the current submission.
    pub remote_handle: Option<String>,
    /// When the current submission was accepted by the worker.
    pub submitted_at: Option<Timestamp>,
    /// When a `retry_wait` or `artifact_pending` job becomes due.
    pub next_retry_at: Option<Timestamp>,
    pub artifact: Option<RemoteArtifact>,
    /// Storage location, set only once the job has succeeded.
    pub result_reference: Option<String>,
    pub last_error: Option<JobError>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Create a freshly queued job.
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7(),
            kind,
            payload,
            status: JobStatus::Queued,
            worker_id: None,
            attempt_count: 0,
            upload_attempts: 0,
            remote_handle: None,
            submitted_at: None,
            next_retry_at: None,
            artifact: None,
            result_reference: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a waiting job (`retry_wait` or `artifact_pending`) is due.
    ///
    /// Jobs without a recorded retry time are always due.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Deterministic storage key for this job's artifact.
    ///
    /// Re-uploads of the same artifact land on the same key.
    pub fn artifact_key(&self, artifact: &RemoteArtifact) -> String {
        format!(
            "{}/{}/{}",
            self.kind.storage_prefix(),
            self.id,
            artifact.filename
        )
    }
}

/// Validate an intake payload: it must be a JSON object.
pub fn validate_payload(payload: &serde_json::Value) -> Result<(), CoreError> {
    if payload.is_object() {
        Ok(())
    } else {
        Err(CoreError::Validation(
            "Job payload must be a JSON object".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
