//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid definition: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Mount path {mount} is already leased by {holder}")]
    LeaseConflict { mount: String, holder: String },

    #[error("Release failed: {0}")]
    Release(#[from] ReleaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Another run is active (pid {0})")]
    AlreadyRunning(i32),

    #[error("Task error: {0}")]
    Task(String),
}

/// A single failed call against the external snapshot tool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{step}: {cause}")]
pub struct SnapshotError {
    pub step: &'static str,
    pub cause: String,
}

impl SnapshotError {
    pub fn new(step: &'static str, cause: impl Into<String>) -> Self {
        Self {
            step,
            cause: cause.into(),
        }
    }
}

/// Every sub-step that failed during a lease release, in the order attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ReleaseError {
    pub failures: Vec<SnapshotError>,
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_error_lists_every_step() {
        let err = ReleaseError {
            failures: vec![
                SnapshotError::new("unmount", "target is busy"),
                SnapshotError::new("destroy-snapshot", "dataset has dependent clones"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "unmount: target is busy; destroy-snapshot: dataset has dependent clones"
        );
    }

    #[test]
    fn test_snapshot_error_wraps_into_engine_error() {
        let err: EngineError = SnapshotError::new("clone-create", "out of space").into();
        assert_eq!(err.to_string(), "clone-create: out of space");
    }
}
