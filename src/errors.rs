//! Error kinds surfaced by the job engine.
//!
//! `NotFound` and `PermissionDenied` are reported to callers with the same
//! message so job identifiers cannot be enumerated; logs keep the real cause.

use thiserror::Error;
use tonic::Status;

/// Message shared by `NotFound` and `PermissionDenied` responses.
const NOT_AUTHORIZED: &str = "job not found or not authorized";

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Unknown job identifier.
    #[error("job not found")]
    NotFound,

    /// Requester identity does not match the job owner, or no identity was
    /// presented at all.
    #[error("permission denied")]
    PermissionDenied,

    /// Malformed request (empty command vector, empty program name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The isolation helper could not be launched.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The helper launched but failed during pre-exec setup (namespaces,
    /// cgroup, rootfs); detected via its sentinel exit code.
    #[error("isolation failed: {0}")]
    IsolationFailed(String),

    /// Unrecoverable programming or kernel-interface error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WorkerError> for Status {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::NotFound => Status::not_found(NOT_AUTHORIZED),
            WorkerError::PermissionDenied => Status::permission_denied(NOT_AUTHORIZED),
            WorkerError::InvalidArgument(msg) => Status::invalid_argument(msg),
            WorkerError::SpawnFailed(msg) => Status::internal(format!("spawn failed: {msg}")),
            WorkerError::IsolationFailed(msg) => {
                Status::internal(format!("isolation failed: {msg}"))
            }
            WorkerError::Internal(msg) => Status::internal(msg),
        }
    }
}
