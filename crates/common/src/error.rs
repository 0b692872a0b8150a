//! Error types for Livefire

use crate::types::TaskKind;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using Livefire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Livefire error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Endpoint unreachable, malformed parameters or rejected credentials.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Resource not found: {kind} {name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind} {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("{count} virtual machines are named {name}; refusing to pick one")]
    AmbiguousVm { name: String, count: usize },

    /// Zero or several snapshots carry the requested name.
    #[error("{}", snapshot_match_message(.vm, .snapshot, .count))]
    SnapshotMatch {
        vm: String,
        snapshot: String,
        count: usize,
    },

    #[error("Revert task failed: {0}")]
    RevertTask(String),

    /// The VM was reverted but did not power on.
    #[error("VM reverted but power-on task failed: {0}")]
    PowerOnTask(String),

    #[error("{task} task did not complete within {timeout:?}")]
    TaskTimeout { task: TaskKind, timeout: Duration },

    #[error("Management API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn snapshot_match_message(vm: &str, snapshot: &str, count: &usize) -> String {
    if *count == 0 {
        format!("No snapshots found with name: {} on VM: {}", snapshot, vm)
    } else {
        format!(
            "{} snapshots found with name: {} on VM: {}; expected exactly one",
            count, snapshot, vm
        )
    }
}

impl Error {
    /// True when the VM was reverted but is not known to be running.
    ///
    /// Remediation for these is a power-on retry, not another revert.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            Error::PowerOnTask(_)
                | Error::TaskTimeout {
                    task: TaskKind::PowerOn,
                    ..
                }
        )
    }

    /// Match count carried by snapshot and VM name ambiguity failures.
    pub fn match_count(&self) -> Option<usize> {
        match self {
            Error::SnapshotMatch { count, .. } | Error::AmbiguousVm { count, .. } => Some(*count),
            _ => None,
        }
    }

    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Database(_) => "database",
            Error::Serialization(_) => "serialization",
            Error::Connection(_) => "connection",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::AmbiguousVm { .. } => "ambiguous_vm",
            Error::SnapshotMatch { .. } => "snapshot_match",
            Error::RevertTask(_) => "revert_task",
            Error::PowerOnTask(_) => "power_on_task",
            Error::TaskTimeout { .. } => "task_timeout",
            Error::Api { .. } => "api",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal(_) => "internal",
        }
    }

    pub(crate) fn vm_not_found(name: &str) -> Self {
        Error::NotFound {
            kind: "VM".to_string(),
            name: name.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_match_messages() {
        let none = Error::SnapshotMatch {
            vm: "target-01".to_string(),
            snapshot: "BASELINE".to_string(),
            count: 0,
        };
        assert_eq!(
            none.to_string(),
            "No snapshots found with name: BASELINE on VM: target-01"
        );
        assert_eq!(none.match_count(), Some(0));

        let many = Error::SnapshotMatch {
            vm: "target-01".to_string(),
            snapshot: "BASELINE".to_string(),
            count: 2,
        };
        assert!(many.to_string().starts_with("2 snapshots found"));
        assert_eq!(many.match_count(), Some(2));
    }

    #[test]
    fn test_partial_failures() {
        assert!(Error::PowerOnTask("host busy".into()).is_partial());
        assert!(Error::TaskTimeout {
            task: TaskKind::PowerOn,
            timeout: Duration::from_secs(5)
        }
        .is_partial());
        assert!(!Error::RevertTask("disk locked".into()).is_partial());
        assert_eq!(
            Error::TaskTimeout {
                task: TaskKind::Revert,
                timeout: Duration::from_millis(250)
            }
            .to_string(),
            "revert task did not complete within 250ms"
        );
        assert!(!Error::TaskTimeout {
            task: TaskKind::Revert,
            timeout: Duration::from_secs(5)
        }
        .is_partial());
    }
}
