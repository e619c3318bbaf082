use charforge_core::error::CoreError;
use charforge_core::job::JobStatus;
use charforge_core::ledger::LedgerError;
use charforge_core::types::JobId;

/// Errors returned by the orchestrator's intake and control operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// No job with this id exists.
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// The request was rejected before any state changed.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// The job is not in a state that allows the operation.
    #[error("Job {id} is {status}")]
    WrongState { id: JobId, status: JobStatus },

    /// The ledger refused the write; nothing was applied.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a transition was not committed.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CommitError {
    /// The job moved on (usually cancelled) since the caller looked at it.
    #[error("job is now {0}")]
    Stale(JobStatus),

    /// The state machine does not allow the transition.
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
