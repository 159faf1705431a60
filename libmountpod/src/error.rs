//! Error types.
//!
//! All fallible operations in this crate return [`Error`]. Transient
//! conditions that only need a retry (an unbound claim, a mount pod that is
//! not visible yet) are either dedicated variants the caller is expected to
//! match on, or not errors at all and expressed through
//! [`crate::reconciler::ReconcileOutcome`].

use thiserror::Error;

/// Unified error type for mount pod orchestration.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// No mount pod matching the requested identity was ever observed.
    #[error("mount pod not found: {0}")]
    PodNotFound(String),

    /// A matching mount pod was observed but never reached `Running`.
    #[error("mount pod for volume {0} was found but never became ready")]
    PodNotReady(String),

    /// More than one mount pod matched a single identity on one node.
    /// This should never happen and indicates a control-plane bug; it is
    /// never resolved automatically.
    #[error("found {count} mount pods on node {node} instead of 1")]
    DuplicateMountPods { count: usize, node: String },

    /// The claim exists but is not bound to a volume yet. Retryable.
    #[error("claim {0} is not bound to a volume yet")]
    ClaimNotBound(String),

    /// The bound volume's back-reference does not point at the claim.
    #[error("volume {volume} has a claim_ref different than claim {claim}")]
    VolumeClaimMismatch { volume: String, claim: String },

    /// A mount target path could not be mapped back to a volume.
    #[error("invalid target path {path}: {reason}")]
    InvalidTarget { path: String, reason: String },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },

    /// The mount-option handoff to the mount pod failed.
    #[error("mount option handoff over {path} failed: {reason}")]
    Ipc { path: String, reason: String },

    /// The credential provider collaborator returned an error.
    #[error("credential provider error: {0}")]
    Credentials(String),

    /// The cluster API returned an error.
    #[error("cluster API error: {0}")]
    Api(String),

    /// The operation was cancelled before producing a result.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Several independent failures from one reconciliation cycle.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<Error>),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an [`Error::Api`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn api<E: std::fmt::Display>(e: E) -> Self {
        Self::Api(e.to_string())
    }

    /// Create an [`Error::Credentials`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn credentials<E: std::fmt::Display>(e: E) -> Self {
        Self::Credentials(e.to_string())
    }

    /// Create an [`Error::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Collapse a list of errors into a single error: `None` when empty,
    /// the error itself for one, [`Error::Aggregate`] otherwise.
    pub fn join(mut errs: Vec<Error>) -> Option<Error> {
        match errs.len() {
            0 => None,
            1 => Some(errs.remove(0)),
            _ => Some(Error::Aggregate(errs)),
        }
    }
}
