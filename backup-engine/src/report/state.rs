//! Job status persisted between runs.
//!
//! Stored as `status.json` in the state directory so that the last success
//! timestamp of a job survives runs in which the job fails.

use super::{JobState, StatusSnapshot};
use crate::executor::job::JobOutcome;
use crate::utils::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "status.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub jobs: BTreeMap<String, PersistedJob>,

    /// Exit code of the most recent run
    #[serde(default)]
    pub last_exit_code: Option<i32>,

    #[serde(default)]
    pub last_run_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub stage: String,
    /// success, failure or timeout
    pub last_outcome: String,
    #[serde(default)]
    pub last_reason: Option<String>,
    /// Unix seconds
    pub last_run_at: i64,
    #[serde(default)]
    pub last_success_at: Option<i64>,
    #[serde(default)]
    pub last_duration_secs: f64,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl PersistedJob {
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success_at.map(from_unix)
    }

    pub fn last_run(&self) -> DateTime<Utc> {
        from_unix(self.last_run_at)
    }

    pub fn outcome(&self) -> JobOutcome {
        match self.last_outcome.as_str() {
            "success" => JobOutcome::Success,
            "timeout" => JobOutcome::Timeout,
            _ => JobOutcome::Failure(self.last_reason.clone().unwrap_or_default()),
        }
    }
}

impl PersistedState {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(STATE_FILE)
    }

    /// Load state; a missing file is an empty history.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file atomically (write to a temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Fold the finished jobs of a run into the history.
    pub fn merge(&mut self, snapshot: &StatusSnapshot) {
        for (name, status) in &snapshot.jobs {
            let JobState::Finished(outcome) = &status.state else {
                continue;
            };
            let finished_at = status.finished_at.unwrap_or(status.started_at).timestamp();
            let previous_success = self.jobs.get(name).and_then(|j| j.last_success_at);

            self.jobs.insert(
                name.clone(),
                PersistedJob {
                    stage: status.stage.clone(),
                    last_outcome: outcome.label().to_string(),
                    last_reason: match outcome {
                        JobOutcome::Failure(reason) => Some(reason.clone()),
                        _ => None,
                    },
                    last_run_at: finished_at,
                    last_success_at: status
                        .last_success
                        .map(|t| t.timestamp())
                        .max(previous_success),
                    last_duration_secs: status.duration.map(|d| d.as_secs_f64()).unwrap_or(0.0),
                },
            );
        }

        if let Some(code) = snapshot.exit_code {
            self.last_exit_code = Some(code);
            self.last_run_at = snapshot.finished_at.map(|t| t.timestamp());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::JobStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn finished(outcome: JobOutcome, at: i64) -> JobStatus {
        JobStatus {
            stage: "2".into(),
            state: JobState::Finished(outcome.clone()),
            started_at: from_unix(at - 10),
            finished_at: Some(from_unix(at)),
            duration: Some(Duration::from_secs(10)),
            last_success: outcome.is_success().then(|| from_unix(at)),
            release_errors: 0,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = PersistedState::load(&PersistedState::path_in(dir.path())).unwrap();
        assert!(state.jobs.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = PersistedState::path_in(&dir.path().join("nested"));

        let mut snapshot = StatusSnapshot::default();
        snapshot.jobs.insert("replicate".into(), finished(JobOutcome::Success, 1_700_000_000));
        snapshot.exit_code = Some(0);

        let mut state = PersistedState::default();
        state.merge(&snapshot);
        state.save(&path).unwrap();

        let loaded = PersistedState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.jobs["replicate"].last_success_at, Some(1_700_000_000));
        assert_eq!(loaded.last_exit_code, Some(0));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_failure_keeps_previous_success() {
        let mut state = PersistedState::default();

        let mut first = StatusSnapshot::default();
        first.jobs.insert("archive".into(), finished(JobOutcome::Success, 1_000));
        state.merge(&first);

        let mut second = StatusSnapshot::default();
        second
            .jobs
            .insert("archive".into(), finished(JobOutcome::Failure("command exited: 1".into()), 2_000));
        state.merge(&second);

        let job = &state.jobs["archive"];
        assert_eq!(job.last_outcome, "failure");
        assert_eq!(job.last_reason.as_deref(), Some("command exited: 1"));
        assert_eq!(job.last_run_at, 2_000);
        assert_eq!(job.last_success_at, Some(1_000));
        assert_eq!(job.outcome(), JobOutcome::Failure("command exited: 1".into()));
    }

    #[test]
    fn test_running_jobs_not_persisted() {
        let mut snapshot = StatusSnapshot::default();
        let mut running = finished(JobOutcome::Success, 100);
        running.state = JobState::Running;
        snapshot.jobs.insert("snap".into(), running);

        let mut state = PersistedState::default();
        state.merge(&snapshot);
        assert!(state.jobs.is_empty());
    }
}
