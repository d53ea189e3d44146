//! Prometheus text exposition of a [`StatusSnapshot`].
//!
//! The text is written for the node-exporter textfile collector and can
//! optionally be pushed to a push-gateway.

use super::{JobState, StatusSnapshot};
use crate::utils::Result;
use prometheus::{Encoder, GaugeVec, IntGauge, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// `backup_job_status` values
pub const STATUS_FAILURE: f64 = 0.0;
pub const STATUS_SUCCESS: f64 = 1.0;
pub const STATUS_RUNNING: f64 = 2.0;

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Render the snapshot as Prometheus text, labelled with `hostname`.
pub fn render(snapshot: &StatusSnapshot, hostname: &str) -> Result<String> {
    let mut common = HashMap::new();
    common.insert("hostname".to_string(), hostname.to_string());
    let registry = Registry::new_custom(None, Some(common))?;

    let status = gauge_vec(
        &registry,
        "backup_job_status",
        "Last job status (0=failure, 1=success, 2=running)",
        &["job", "stage"],
    )?;
    let timeout = gauge_vec(
        &registry,
        "backup_job_timeout",
        "1 if the last run of the job hit its timeout",
        &["job", "stage"],
    )?;
    let duration = gauge_vec(
        &registry,
        "backup_job_duration_seconds",
        "Duration of the last job run",
        &["job", "stage"],
    )?;
    let last_success = gauge_vec(
        &registry,
        "backup_job_last_success_timestamp",
        "Unix time of the last successful job run",
        &["job", "stage"],
    )?;
    let release_errors = gauge_vec(
        &registry,
        "backup_release_errors",
        "Snapshot lease release failures during the last job run",
        &["job"],
    )?;

    for (name, job) in &snapshot.jobs {
        let labels = [name.as_str(), job.stage.as_str()];
        let value = match &job.state {
            JobState::Running => STATUS_RUNNING,
            JobState::Finished(o) if o.is_success() => STATUS_SUCCESS,
            JobState::Finished(_) => STATUS_FAILURE,
        };
        status.with_label_values(&labels).set(value);

        let timed_out = matches!(&job.state, JobState::Finished(o) if o.label() == "timeout");
        timeout
            .with_label_values(&labels)
            .set(if timed_out { 1.0 } else { 0.0 });

        if let Some(d) = job.duration {
            duration.with_label_values(&labels).set(d.as_secs_f64());
        }
        if let Some(at) = job.last_success {
            last_success
                .with_label_values(&labels)
                .set(at.timestamp() as f64);
        }
        release_errors
            .with_label_values(&[name.as_str()])
            .set(job.release_errors as f64);
    }

    // Jobs that did not run this time keep their last success visible.
    for (name, (stage, at)) in &snapshot.previous_success {
        if !snapshot.jobs.contains_key(name) {
            last_success
                .with_label_values(&[name.as_str(), stage.as_str()])
                .set(at.timestamp() as f64);
        }
    }

    if let Some(code) = snapshot.exit_code {
        let exit = IntGauge::new("backup_run_exit_code", "Exit code of the last staged run")?;
        registry.register(Box::new(exit.clone()))?;
        exit.set(code as i64);

        let last_run = IntGauge::new("backup_run_last_timestamp", "Unix time the last staged run finished")?;
        registry.register(Box::new(last_run.clone()))?;
        last_run.set(snapshot.finished_at.map(|t| t.timestamp()).unwrap_or_default());
    }

    if !snapshot.restores.is_empty() {
        let outcome = gauge_vec(
            &registry,
            "restore_outcome",
            "Outcome of the last restore resolution (1 for the reached outcome)",
            &["service", "outcome"],
        )?;
        let method = gauge_vec(
            &registry,
            "restore_method_info",
            "Restore method that populated the target",
            &["service", "method"],
        )?;
        let attempts = gauge_vec(
            &registry,
            "restore_attempts",
            "Restore methods attempted during the last resolution",
            &["service"],
        )?;

        for (service, restore) in &snapshot.restores {
            outcome
                .with_label_values(&[service.as_str(), restore.outcome.label()])
                .set(1.0);
            if let Some(m) = &restore.method {
                method.with_label_values(&[service.as_str(), m.as_str()]).set(1.0);
            }
            attempts
                .with_label_values(&[service.as_str()])
                .set(restore.attempts as f64);
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Writes rendered metrics where the scraper (or gateway) picks them up.
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    textfile: Option<PathBuf>,
    push_gateway: Option<String>,
    job: String,
    hostname: String,
}

impl MetricsExporter {
    /// `job` names both the textfile (`<job>.prom`) and the push-gateway group.
    pub fn new(textfile_dir: Option<&Path>, push_gateway: Option<String>, job: &str, hostname: String) -> Self {
        Self {
            textfile: textfile_dir.map(|dir| dir.join(format!("{}.prom", job))),
            push_gateway,
            job: job.to_string(),
            hostname,
        }
    }

    pub fn textfile(&self) -> Option<&Path> {
        self.textfile.as_deref()
    }

    /// Render and publish. Publishing problems are logged, not returned:
    /// a metrics outage must not change a run's result.
    pub async fn export(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let text = render(snapshot, &self.hostname)?;

        if let Some(path) = &self.textfile {
            match write_atomic(path, &text) {
                Ok(()) => debug!(path = %path.display(), "Metrics written"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics textfile"),
            }
        }

        if let Some(gateway) = &self.push_gateway {
            if let Err(e) = self.push(gateway, text).await {
                warn!(gateway = %gateway, error = %e, "Failed to push metrics");
            }
        }

        Ok(())
    }

    /// Re-export every snapshot the reporter publishes, at most once per
    /// `interval`, so a scraper sees jobs while they run. Ends when the
    /// reporter stops; the caller does the final export.
    pub fn follow(self, mut snapshots: watch::Receiver<Arc<StatusSnapshot>>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().clone();
                if let Err(e) = self.export(&snapshot).await {
                    warn!(error = %e, "Failed to render metrics");
                }
                tokio::time::sleep(interval).await;
            }
            debug!(job = %self.job, "Metrics follower stopped");
        })
    }

    async fn push(&self, gateway: &str, body: String) -> std::result::Result<(), reqwest::Error> {
        let url = format!(
            "{}/metrics/job/{}/instance/{}",
            gateway.trim_end_matches('/'),
            self.job,
            self.hostname
        );
        reqwest::Client::new()
            .put(&url)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Readers never observe a half-written file.
fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::job::JobOutcome;
    use crate::report::{JobStatus, RestoreOutcome, RestoreStatus};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn job(state: JobState, last_success: Option<i64>) -> JobStatus {
        JobStatus {
            stage: "2".into(),
            state,
            started_at: Utc.timestamp_opt(1_000, 0).unwrap(),
            finished_at: Some(Utc.timestamp_opt(1_030, 0).unwrap()),
            duration: Some(Duration::from_secs(30)),
            last_success: last_success.map(|t| Utc.timestamp_opt(t, 0).unwrap()),
            release_errors: 0,
        }
    }

    fn sample() -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();
        snapshot
            .jobs
            .insert("replicate-a".into(), job(JobState::Finished(JobOutcome::Success), Some(1_030)));
        snapshot
            .jobs
            .insert("replicate-b".into(), job(JobState::Finished(JobOutcome::Timeout), None));
        snapshot.previous_success.insert(
            "archive".into(),
            ("3".into(), Utc.timestamp_opt(500, 0).unwrap()),
        );
        snapshot.exit_code = Some(1);
        snapshot.finished_at = Some(Utc.timestamp_opt(1_031, 0).unwrap());
        snapshot
    }

    #[test]
    fn test_render_job_metrics() {
        let text = render(&sample(), "forge").unwrap();

        assert!(text.contains("# TYPE backup_job_status gauge"));
        assert!(text.contains(r#"backup_job_status{job="replicate-a",stage="2",hostname="forge"} 1"#));
        assert!(text.contains(r#"backup_job_status{job="replicate-b",stage="2",hostname="forge"} 0"#));
        assert!(text.contains(r#"backup_job_timeout{job="replicate-b",stage="2",hostname="forge"} 1"#));
        assert!(text.contains(r#"backup_job_last_success_timestamp{job="replicate-a",stage="2",hostname="forge"} 1030"#));
        assert!(text.contains(r#"backup_job_last_success_timestamp{job="archive",stage="3",hostname="forge"} 500"#));
        assert!(text.contains(r#"backup_run_exit_code{hostname="forge"} 1"#));
        assert!(!text.contains("restore_outcome"));
    }

    #[test]
    fn test_render_restore_metrics() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.restores.insert(
            "sonarr".into(),
            RestoreStatus {
                outcome: RestoreOutcome::Populated,
                method: Some("local-snapshot".into()),
                attempts: 2,
            },
        );

        let text = render(&snapshot, "forge").unwrap();
        assert!(text.contains(r#"restore_outcome{outcome="populated",service="sonarr",hostname="forge"} 1"#));
        assert!(text.contains(r#"restore_method_info{method="local-snapshot",service="sonarr",hostname="forge"} 1"#));
        assert!(text.contains(r#"restore_attempts{service="sonarr",hostname="forge"} 2"#));
        assert!(!text.contains("backup_run_exit_code"));
    }

    #[tokio::test]
    async fn test_export_writes_textfile() {
        let dir = TempDir::new().unwrap();
        let exporter = MetricsExporter::new(Some(dir.path()), None, "backup-engine", "forge".into());

        exporter.export(&sample()).await.unwrap();

        let path = dir.path().join("backup-engine.prom");
        assert_eq!(exporter.textfile(), Some(path.as_path()));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("backup_job_status"));
        assert!(!dir.path().join("backup-engine.prom.tmp").exists());
    }

    async fn wait_for(path: &Path, needle: &str) -> String {
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(path) {
                if content.contains(needle) {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never contained {}", path.display(), needle);
    }

    #[tokio::test]
    async fn test_follow_exports_while_jobs_run() {
        let dir = TempDir::new().unwrap();
        let exporter = MetricsExporter::new(Some(dir.path()), None, "backup-engine", "forge".into());
        let path = dir.path().join("backup-engine.prom");
        let (handle, aggregator) = crate::report::Reporter::new().spawn();
        let follower = exporter.follow(handle.watch_snapshots(), Duration::ZERO);

        handle.job_started("snap", "1");
        wait_for(&path, r#"backup_job_status{job="snap",stage="1",hostname="forge"} 2"#).await;

        handle.job_finished("snap", "1", JobOutcome::Success, Duration::from_secs(3));
        handle.job_started("replicate-a", "2");
        let content = wait_for(&path, r#"backup_job_status{job="replicate-a",stage="2",hostname="forge"} 2"#).await;
        assert!(content.contains(r#"backup_job_status{job="snap",stage="1",hostname="forge"} 1"#));
        assert!(!content.contains("backup_run_exit_code"));

        drop(handle);
        aggregator.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), follower).await.unwrap().unwrap();
    }
}
