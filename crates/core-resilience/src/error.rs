//! Error types for the polling primitives

use std::time::Duration;
use thiserror::Error;

/// Why a [`PollLoop`](crate::PollLoop) stopped without producing a value
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The step function returned an error; the loop stopped immediately
    #[error("{0}")]
    Aborted(E),

    /// The configured attempt cap was reached
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u64 },

    /// The configured deadline elapsed before the step reported ready
    #[error("deadline of {deadline:?} elapsed after {attempts} attempts")]
    DeadlineElapsed { deadline: Duration, attempts: u64 },
}

impl<E> PollError<E> {
    /// Returns the step error if the loop was aborted by one
    pub fn into_aborted(self) -> Option<E> {
        match self {
            PollError::Aborted(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the loop stopped because a bound was hit rather than an error
    pub fn is_bound(&self) -> bool {
        !matches!(self, PollError::Aborted(_))
    }
}

/// Failure modes of the known-state wait
#[derive(Debug, Error)]
pub enum KnownStateError<E> {
    /// At least one node reported the error status literal
    #[error("nodes reported error status: {}", .failed.join(", "))]
    NodeError { failed: Vec<String> },

    /// The status lookup or the per-tick hook failed
    #[error("{0}")]
    Lookup(E),

    /// A bound configured on the wait was hit
    #[error("nodes not ready after {attempts} polls")]
    Exhausted { attempts: u64 },
}
