//! Error taxonomy for the control plane.
//!
//! `Conflict` (preemption-in-progress) is intentionally absent: it is always
//! resolved internally by `Supervisor::launch` and must never be surfaced.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("recipe not found: {0}")]
    NotFound(String),

    #[error("process exited early: {tail}")]
    BackendSpawnFailed { tail: String },

    #[error("backend readiness timeout after {secs}s")]
    BackendReadinessTimeout { secs: u64 },

    #[error("backend crashed: {tail}")]
    BackendCrashed { tail: String },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream error ({status}): {body}")]
    UpstreamError { status: u16, body: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
