//! Error types for the execution core.
//!
//! Two layers of error reporting exist side by side:
//!
//! - [`ErrorKind`] is the *result taxonomy*: a finished operation that did
//!   not succeed carries exactly one of these in its
//!   [`OperationResult`](crate::core::OperationResult). These never
//!   propagate as `Err`; controllers fold every internal fault into a
//!   `success = false` result.
//! - [`BenchError`] is the crate error type for everything decided
//!   *synchronously* at API boundaries (busy guard, connection guard,
//!   configuration, I/O). Built with `thiserror` so callers can use `?`
//!   and match on variants.
//!
//! `BusyError` and `ConnectionError` are deliberately only reachable
//! through [`BenchError`]: they are decided before a task is created and
//! never travel through the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

/// Classification of a failed operation, carried in `OperationResult`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Endpoint unreachable.
    Connection,
    /// Device locked by another operation.
    Busy,
    /// Reachability probe failed after connect.
    Verification,
    /// Device reported an abnormal condition.
    HardwareFault,
    /// Iterative procedure exceeded its bound.
    Convergence,
    /// Operator input not supplied in time.
    Timeout,
    /// Operator- or system-initiated abort.
    Cancelled,
    /// Artifact write failure.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection error",
            ErrorKind::Busy => "device busy",
            ErrorKind::Verification => "verification failed",
            ErrorKind::HardwareFault => "hardware fault",
            ErrorKind::Convergence => "convergence error",
            ErrorKind::Timeout => "input timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "artifact I/O error",
        };
        f.write_str(name)
    }
}

/// Errors surfaced synchronously at the execution-core API boundary.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device '{0}' is busy with another operation")]
    Busy(String),

    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    #[error("Device '{device}' unreachable at {address}: {reason}")]
    Unreachable {
        device: String,
        address: String,
        reason: String,
    },

    #[error("Device verification failed: {0}")]
    Verification(String),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Scheduler is shutting down, task rejected")]
    ShuttingDown,

    #[error("Driver error: {0}")]
    Driver(String),
}

impl BenchError {
    /// Maps the boundary error onto the result taxonomy, for presenters
    /// that render both through the same path.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Busy(_) => ErrorKind::Busy,
            BenchError::NotConnected(_) | BenchError::Unreachable { .. } => ErrorKind::Connection,
            BenchError::Verification(_) => ErrorKind::Verification,
            BenchError::Io(_) => ErrorKind::Io,
            BenchError::ShuttingDown => ErrorKind::Cancelled,
            BenchError::Config(_)
            | BenchError::Configuration(_)
            | BenchError::UnknownDevice(_)
            | BenchError::Driver(_) => ErrorKind::HardwareFault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BenchError::Busy("vu".to_string());
        assert_eq!(
            err.to_string(),
            "Device 'vu' is busy with another operation"
        );
    }

    #[test]
    fn test_boundary_errors_map_to_taxonomy() {
        assert_eq!(BenchError::Busy("x".into()).kind(), ErrorKind::Busy);
        assert_eq!(
            BenchError::NotConnected("x".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            BenchError::Verification("probe ok, open refused".into()).kind(),
            ErrorKind::Verification
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::HardwareFault).unwrap();
        assert_eq!(json, "\"hardware_fault\"");
    }
}
