//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] and converts into a [`tonic::Status`]
//! at the gRPC boundary.

use thiserror::Error;
use tonic::{Code, Status};

use crate::lifecycle::ServerState;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Clone)]
pub enum CsiError {
    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The hosting volume listing could not be read.
    #[error("unable to list hosting volumes: {0}")]
    ListingFailed(String),

    /// An external command exited unsuccessfully or could not be spawned.
    #[error("command `{command}` failed ({}): {stderr}", exit_code_display(.code))]
    CommandFailed {
        /// Program and arguments, space separated.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured standard error (trimmed).
        stderr: String,
    },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A per-volume operation exceeded its deadline.
    #[error("{operation} of volume {volume} timed out after {secs}s")]
    Timeout {
        /// `"mount"` or `"reload"`.
        operation: &'static str,
        /// Hosting volume name.
        volume: String,
        /// Configured deadline in seconds.
        secs: u64,
    },

    /// The server lifecycle was asked to perform an invalid transition.
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state.
        from: ServerState,
        /// Requested state.
        to: ServerState,
    },

    /// The storage backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A listener / gRPC transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn exit_code_display(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by signal".to_owned(),
    }
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        let code = match &err {
            CsiError::VolumeNotFound(_) => Code::NotFound,
            CsiError::InvalidArgument(_) => Code::InvalidArgument,
            CsiError::Timeout { .. } => Code::DeadlineExceeded,
            CsiError::InvalidTransition { .. } => Code::FailedPrecondition,
            CsiError::ListingFailed(_) | CsiError::TransportError(_) => Code::Unavailable,
            CsiError::CommandFailed { .. }
            | CsiError::MountFailed { .. }
            | CsiError::UnmountFailed { .. }
            | CsiError::BackendError(_)
            | CsiError::Internal(_) => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}
