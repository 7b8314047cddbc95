//! The job state machine.
//!
//! A single transition table is the authority for every status change in
//! the system. Stores call [`check_transition`] inside their critical
//! section; everything else (scheduler, routes, agents) only requests
//! transitions and observes the result.

use thiserror::Error;

use crate::job::JobStatus;

/// A transition request was not legal from the job's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Outcome of a legality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// The transition is legal and changes state.
    Apply,
    /// The job already sits in the target state; an idempotent no-op.
    Noop,
}

/// The legal transition table. Everything not listed is illegal.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Queued, Assigned)
            | (Queued, Rejected)
            | (Queued, Canceled)
            | (Assigned, Running)
            | (Assigned, Retrying)
            | (Assigned, Canceled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, TimedOut)
            | (Running, Retrying)
            | (Running, Paused)
            | (Running, Canceled)
            | (Paused, Running)
            | (Paused, Canceled)
            | (Retrying, Queued)
            | (Retrying, Failed)
            | (TimedOut, Retrying)
            | (TimedOut, Failed)
            | (Failed, Retrying)
    )
}

/// Validate a requested transition.
///
/// Same-state requests are reported as [`TransitionCheck::Noop`] rather
/// than an error so that repeated acknowledgements (worker claim retries,
/// duplicate result reports) stay idempotent.
pub fn check_transition(
    from: JobStatus,
    to: JobStatus,
) -> Result<TransitionCheck, IllegalTransition> {
    if from == to {
        return Ok(TransitionCheck::Noop);
    }
    if transition_allowed(from, to) {
        Ok(TransitionCheck::Apply)
    } else {
        Err(IllegalTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 11] = [
        Pending, Queued, Assigned, Running, Retrying, Completed, Failed, TimedOut, Canceled,
        Paused, Rejected,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [Completed, Canceled, Rejected] {
            for to in ALL {
                if to != terminal {
                    assert!(
                        !transition_allowed(terminal, to),
                        "{terminal} -> {to} must be illegal"
                    );
                }
            }
        }
    }

    #[test]
    fn test_failed_only_exits_to_retrying() {
        for to in ALL {
            let legal = transition_allowed(Failed, to);
            assert_eq!(legal, to == Retrying, "failed -> {to}");
        }
    }

    #[test]
    fn test_happy_path() {
        let path = [Pending, Queued, Assigned, Running, Completed];
        for pair in path.windows(2) {
            assert!(transition_allowed(pair[0], pair[1]));
        }
    }

    #[test]
    fn test_retry_loop() {
        for pair in [(Running, Retrying), (Retrying, Queued), (Queued, Assigned)] {
            assert!(transition_allowed(pair.0, pair.1));
        }
    }

    #[test]
    fn test_noop_is_not_an_error() {
        for s in ALL {
            assert_eq!(check_transition(s, s), Ok(TransitionCheck::Noop));
        }
    }

    #[test]
    fn test_pending_cannot_jump_to_running() {
        assert!(check_transition(Pending, Running).is_err());
    }

    #[test]
    fn test_rejection_only_from_queued() {
        for from in ALL {
            let legal = transition_allowed(from, Rejected);
            assert_eq!(legal, from == Queued, "{from} -> rejected");
        }
    }
}
