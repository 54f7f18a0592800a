//! Failure taxonomy of the resize engine.
//!
//! Every sub-step reports either forward progress ([`Progress`]) or an error
//! whose variant decides how the reconcile loop reacts: transient errors are
//! retried with backoff by the runtime, an [`ResizeError::Abort`] allows the
//! StatefulSet to be scaled back up before it is marked failed, and a
//! [`ResizeError::Critical`] leaves it scaled down for an operator.

use thiserror::Error;

/// Happy-path ternary of an idempotent sub-step.
///
/// `InProgress` is not an error: it signals that the step is waiting on the
/// cluster (a scale-down converging, a copy-job still running) and the caller
/// should requeue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Progress {
    Done,
    InProgress,
}

impl Progress {
    pub fn is_done(self) -> bool {
        matches!(self, Progress::Done)
    }
}

/// Errors surfaced by the resize engine.
#[derive(Debug, Error)]
pub enum ResizeError {
    /// Cluster API failure. Retried with backoff by the controller runtime.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Persisted state on the StatefulSet is unreadable.
    #[error("annotation {annotation} malformed: {reason}")]
    Plan { annotation: String, reason: String },

    /// Inconsistent state reached before any destructive step; scaling the
    /// StatefulSet back up is safe.
    #[error("{0}")]
    Abort(String),

    /// Inconsistent state after the original claim may have been deleted or
    /// undersized; automatic scale-up is unsafe.
    #[error("{0}")]
    Critical(String),
}

impl ResizeError {
    /// Whether the workload may be scaled back up before being marked failed.
    pub fn safe_to_scale_up(&self) -> bool {
        matches!(self, ResizeError::Abort(_))
    }

    /// Whether the error is terminal for the workload, as opposed to a
    /// transient condition the runtime retries.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResizeError::Abort(_) | ResizeError::Critical(_) | ResizeError::Plan { .. }
        )
    }
}
