//! Backup job definitions and outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External program and arguments; `{path}` in an argument is replaced
/// with the resolved input path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }

    /// `sh -c <script>`, mostly for tests and ad-hoc jobs
    pub fn shell(script: &str) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.to_string()])
    }
}

/// One unit of backup work.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub name: String,
    pub stage: String,
    pub command: CommandSpec,
    pub uses_snapshot: bool,
    /// Live volume; the command input when no snapshot is used
    pub snapshot_source: Option<PathBuf>,
    /// Where the snapshot clone is mounted for the command
    pub snapshot_mount: Option<PathBuf>,
    pub timeout: Duration,
    /// Failure aborts all later stages
    pub critical: bool,
}

impl BackupJob {
    /// Job running `command` against the live path, without a snapshot
    pub fn new(name: &str, stage: &str, command: CommandSpec, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            stage: stage.to_string(),
            command,
            uses_snapshot: false,
            snapshot_source: None,
            snapshot_mount: None,
            timeout,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_snapshot(mut self, source: impl AsRef<Path>, mount: impl AsRef<Path>) -> Self {
        self.uses_snapshot = true;
        self.snapshot_source = Some(source.as_ref().to_path_buf());
        self.snapshot_mount = Some(mount.as_ref().to_path_buf());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure(String),
    Timeout,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }

    /// Short label used in metrics and persisted state
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failure(_) => "failure",
            JobOutcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "success"),
            JobOutcome::Failure(reason) => write!(f, "failure ({})", reason),
            JobOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_job_builder() {
        let job = BackupJob::new("archive", "3", CommandSpec::shell("true"), Duration::from_secs(30))
            .with_snapshot("/srv/media", "/mnt/media")
            .critical();

        assert!(job.uses_snapshot);
        assert!(job.critical);
        assert_eq!(job.snapshot_mount.as_deref(), Some(Path::new("/mnt/media")));
        assert_eq!(job.command.args, vec!["-c", "true"]);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(JobOutcome::Success.to_string(), "success");
        assert_eq!(
            JobOutcome::Failure("command exited: 2".into()).to_string(),
            "failure (command exited: 2)"
        );
        assert_eq!(JobOutcome::Timeout.label(), "timeout");
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&JobOutcome::Failure("boom".into())).unwrap();
        assert_eq!(json, r#"{"outcome":"failure","reason":"boom"}"#);
    }
}
