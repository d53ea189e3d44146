//! `status` view over the persisted job history.

use super::state::PersistedState;
use crate::executor::job::JobOutcome;
use crate::utils::format::format_age;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Ok,
    Failed,
    Timeout,
    /// Last success older than the stale threshold
    Stale,
    /// Never succeeded
    Never,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "OK",
            Health::Failed => "FAILED",
            Health::Timeout => "TIMEOUT",
            Health::Stale => "STALE",
            Health::Never => "NEVER",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub job: String,
    pub stage: String,
    pub health: Health,
    pub last_run: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub rows: Vec<StatusRow>,
    pub last_exit_code: Option<i32>,
    pub generated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn build(state: &PersistedState, stale_after: Duration, now: DateTime<Utc>) -> Self {
        let stale_secs = i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX);

        let mut rows: Vec<StatusRow> = state
            .jobs
            .iter()
            .map(|(name, job)| {
                let last_success = job.last_success();
                let health = match (job.outcome(), last_success) {
                    (_, None) => Health::Never,
                    (JobOutcome::Timeout, _) => Health::Timeout,
                    (JobOutcome::Failure(_), _) => Health::Failed,
                    (JobOutcome::Success, Some(at)) if (now - at).num_seconds() > stale_secs => Health::Stale,
                    (JobOutcome::Success, Some(_)) => Health::Ok,
                };
                StatusRow {
                    job: name.clone(),
                    stage: job.stage.clone(),
                    health,
                    last_run: job.last_run(),
                    last_success,
                    reason: job.last_reason.clone(),
                }
            })
            .collect();

        rows.sort_by(|a, b| a.stage.cmp(&b.stage).then_with(|| a.job.cmp(&b.job)));

        Self {
            rows,
            last_exit_code: state.last_exit_code,
            generated_at: now,
        }
    }

    /// Anything other than OK needs attention.
    pub fn healthy(&self) -> bool {
        self.rows.iter().all(|r| r.health == Health::Ok)
    }

    pub fn render_text(&self) -> String {
        if self.rows.is_empty() {
            return "No backup runs recorded yet\n".to_string();
        }

        let width = self.rows.iter().map(|r| r.job.len()).max().unwrap_or(0).max(3);
        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:<5}  {:<7}  LAST SUCCESS", "JOB", "STAGE", "STATUS");
        for row in &self.rows {
            let age = match row.last_success {
                Some(at) => format_age((self.generated_at - at).num_seconds()),
                None => "never".to_string(),
            };
            let _ = write!(out, "{:<width$}  {:<5}  {:<7}  {}", row.job, row.stage, row.health.as_str(), age);
            if let Some(reason) = &row.reason {
                let _ = write!(out, " ({})", reason);
            }
            out.push('\n');
        }
        if let Some(code) = self.last_exit_code {
            let _ = writeln!(out, "Last run exit code: {}", code);
        }
        out
    }
}
