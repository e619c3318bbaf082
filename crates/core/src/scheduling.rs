//! Job state machine.
//!
//! Every status change made by the orchestrator is checked against this
//! table before it is written to the ledger.

use crate::job::JobStatus;

/// Returns the set of statuses reachable from `from`.
///
/// Terminal states (Succeeded, Failed, Cancelled) return an empty slice
/// because no further transitions are allowed.
pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;

    match from {
        Queued => &[Assigning, RetryWait, Cancelled],
        Assigning => &[Running, RetryWait, Failed, Cancelled],
        Running => &[Uploading, RetryWait, Failed, Cancelled],
        Uploading => &[Succeeded, ArtifactPending, RetryWait, Failed, Cancelled],
        RetryWait => &[Assigning, Cancelled],
        ArtifactPending => &[Uploading, Cancelled],
        Succeeded | Failed | Cancelled => &[],
    }
}

/// Check whether a transition from `from` to `to` is valid.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a state transition, returning an error message for invalid ones.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(format!("Invalid transition: {from} -> {to}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[test]
    fn happy_path_is_valid() {
        let path = [Queued, Assigning, Running, Uploading, Succeeded];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    // -----------------------------------------------------------------------
    // Retry loop
    // -----------------------------------------------------------------------

    #[test]
    fn active_states_can_enter_retry_wait() {
        for from in [Queued, Assigning, Running, Uploading] {
            assert!(can_transition(from, RetryWait), "{from} -> retry_wait");
        }
    }

    #[test]
    fn retry_wait_returns_to_assigning_only() {
        assert!(can_transition(RetryWait, Assigning));
        assert!(!can_transition(RetryWait, Running));
        assert!(!can_transition(RetryWait, Queued));
    }

    #[test]
    fn budget_exhaustion_fails_from_active_states() {
        assert!(can_transition(Assigning, Failed));
        assert!(can_transition(Running, Failed));
        assert!(can_transition(Uploading, Failed));
        assert!(!can_transition(Queued, Failed));
    }

    // -----------------------------------------------------------------------
    // Upload loop
    // -----------------------------------------------------------------------

    #[test]
    fn artifact_pending_only_goes_back_to_uploading_or_cancelled() {
        assert!(can_transition(Uploading, ArtifactPending));
        assert!(can_transition(ArtifactPending, Uploading));
        assert!(!can_transition(ArtifactPending, Succeeded));
        assert!(!can_transition(ArtifactPending, RetryWait));
        assert!(!can_transition(ArtifactPending, Failed));
    }

    // -----------------------------------------------------------------------
    // Cancellation and terminal states
    // -----------------------------------------------------------------------

    #[test]
    fn every_non_terminal_state_can_be_cancelled() {
        for from in JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(can_transition(from, Cancelled), "{from} -> cancelled");
        }
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        for from in [Succeeded, Failed, Cancelled] {
            assert!(valid_transitions(from).is_empty());
        }
    }

    #[test]
    fn validate_transition_reports_names() {
        let err = validate_transition(Succeeded, Running).unwrap_err();
        assert_eq!(err, "Invalid transition: succeeded -> running");
        assert!(validate_transition(Queued, Assigning).is_ok());
    }
}
