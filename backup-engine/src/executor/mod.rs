//! Backup job executor - runs one job to a settled outcome.
//!
//! A run is: report start, acquire the snapshot lease if the job needs one,
//! run the command against the mount (or the live path) under the job's
//! deadline, release the lease, report the outcome. Every path through
//! [`JobRunner::run`] produces exactly one [`JobOutcome`] and releases any
//! lease it acquired.

pub mod job;

use crate::exec::{run_with_deadline, ExecStatus};
use crate::report::{ReportEvent, ReporterHandle};
use crate::snapshot::{LeaseGuard, LeaseManager};
use futures_util::FutureExt;
use job::{BackupJob, JobOutcome};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared by every job task of a run.
#[derive(Clone)]
pub struct JobRunner {
    leases: Arc<LeaseManager>,
    reporter: ReporterHandle,
    kill_grace: Duration,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(
        leases: Arc<LeaseManager>,
        reporter: ReporterHandle,
        kill_grace: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            leases,
            reporter,
            kill_grace,
            cancel,
        }
    }

    pub fn reporter(&self) -> &ReporterHandle {
        &self.reporter
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run under the job's own timeout.
    pub async fn run(&self, job: &BackupJob) -> JobOutcome {
        self.run_with_timeout(job, job.timeout).await
    }

    /// Run with `timeout` in place of the job's own, used when a run
    /// deadline leaves less time than the job would normally get.
    pub async fn run_with_timeout(&self, job: &BackupJob, timeout: Duration) -> JobOutcome {
        let start = Instant::now();
        self.reporter.job_started(&job.name, &job.stage);
        info!(job = %job.name, stage = %job.stage, ?timeout, "Job started");

        let outcome = self.execute(job, timeout).await;

        let duration = start.elapsed();
        match &outcome {
            JobOutcome::Success => info!(job = %job.name, ?duration, "Job succeeded"),
            JobOutcome::Timeout => warn!(job = %job.name, ?duration, "Job timed out"),
            JobOutcome::Failure(reason) => warn!(job = %job.name, ?duration, %reason, "Job failed"),
        }
        self.reporter
            .job_finished(&job.name, &job.stage, outcome.clone(), duration);
        outcome
    }

    /// Lease acquisition and the command share `timeout`; release gets
    /// `kill_grace` on top of it.
    async fn execute(&self, job: &BackupJob, timeout: Duration) -> JobOutcome {
        let deadline = Instant::now() + timeout;

        let guard = if job.uses_snapshot {
            let (Some(source), Some(mount)) = (job.snapshot_source.clone(), job.snapshot_mount.clone()) else {
                return JobOutcome::Failure("snapshot-acquire: job has no snapshot source or mount".into());
            };
            match LeaseGuard::acquire(Arc::clone(&self.leases), source, mount, timeout).await {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    warn!(job = %job.name, ?timeout, "Snapshot lease not mounted before the job deadline");
                    return JobOutcome::Timeout;
                }
                Err(e) => return JobOutcome::Failure(format!("snapshot-acquire: {}", e)),
            }
        } else {
            None
        };

        let input: Option<PathBuf> = match &guard {
            Some(guard) => Some(guard.mount_path().to_path_buf()),
            None => job.snapshot_source.clone(),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = if remaining.is_zero() {
            JobOutcome::Timeout
        } else {
            let exec = run_with_deadline(
                &job.command.program,
                &job.command.args,
                input.as_deref(),
                remaining,
                self.kill_grace,
                &self.cancel,
            );
            match AssertUnwindSafe(exec).catch_unwind().await {
                Ok(status) => outcome_of(status),
                Err(_) => {
                    error!(job = %job.name, "Job task panicked");
                    JobOutcome::Failure("job panicked".into())
                }
            }
        };

        if let Some(guard) = guard {
            let lease = guard.lease().id.clone();
            let error = match tokio::time::timeout(self.kill_grace, guard.release()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                // The release keeps running on its blocking thread.
                Err(_) => Some(format!("release still running after {:?}", self.kill_grace)),
            };
            if let Some(error) = error {
                warn!(job = %job.name, %lease, %error, "Snapshot lease release failed");
                self.reporter.record(ReportEvent::ReleaseFailed {
                    job: job.name.clone(),
                    error,
                });
            }
        }

        outcome
    }
}

fn outcome_of(status: ExecStatus) -> JobOutcome {
    match status {
        ExecStatus::Exited(Some(0)) => JobOutcome::Success,
        ExecStatus::Exited(Some(code)) => JobOutcome::Failure(format!("command exited: {}", code)),
        ExecStatus::Exited(None) => JobOutcome::Failure("command killed by signal".into()),
        ExecStatus::TimedOut => JobOutcome::Timeout,
        ExecStatus::Cancelled => JobOutcome::Failure("cancelled".into()),
        ExecStatus::SpawnFailed(e) => JobOutcome::Failure(format!("command failed to start: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Reporter;
    use crate::snapshot::fake::FakeSnapshotTool;
    use job::CommandSpec;

    fn runner(tool: &Arc<FakeSnapshotTool>) -> (JobRunner, Arc<LeaseManager>) {
        let leases = Arc::new(LeaseManager::new(tool.clone(), "test"));
        let (reporter, _task) = Reporter::new().spawn();
        let runner = JobRunner::new(
            Arc::clone(&leases),
            reporter,
            Duration::from_millis(200),
            CancellationToken::new(),
        );
        (runner, leases)
    }

    fn job(name: &str, script: &str) -> BackupJob {
        BackupJob::new(name, "2", CommandSpec::shell(script), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_success_and_failure() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, _) = runner(&tool);

        assert_eq!(runner.run(&job("ok", "exit 0")).await, JobOutcome::Success);
        assert_eq!(
            runner.run(&job("bad", "exit 3")).await,
            JobOutcome::Failure("command exited: 3".into())
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, _) = runner(&tool);

        let start = Instant::now();
        let outcome = runner
            .run_with_timeout(&job("slow", "sleep 30"), Duration::from_millis(300))
            .await;
        assert_eq!(outcome, JobOutcome::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_snapshot_job_runs_against_mount_and_releases() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, leases) = runner(&tool);

        let job = job("archive", r#"test "$BACKUP_INPUT_PATH" = /mnt/media"#)
            .with_snapshot("/srv/media", "/mnt/media");
        assert_eq!(runner.run(&job).await, JobOutcome::Success);

        assert_eq!(tool.live_objects(), 0);
        assert!(leases.mounted_at(std::path::Path::new("/mnt/media")).is_empty());
    }

    #[tokio::test]
    async fn test_failed_command_still_releases() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, _) = runner(&tool);

        let job = job("archive", "exit 1").with_snapshot("/srv/media", "/mnt/media");
        assert!(!runner.run(&job).await.is_success());
        assert_eq!(tool.live_objects(), 0);
        assert_eq!(tool.calls().last().map(String::as_str), Some("snapshot-destroy"));
    }

    #[tokio::test]
    async fn test_acquire_failure_skips_command() {
        let tool = Arc::new(FakeSnapshotTool::failing(&["clone-mount"]));
        let (runner, _) = runner(&tool);
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran");

        let job = job("archive", &format!("touch {}", marker.display()))
            .with_snapshot("/srv/media", "/mnt/media");
        match runner.run(&job).await {
            JobOutcome::Failure(reason) => assert!(reason.starts_with("snapshot-acquire:"), "{}", reason),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!marker.exists());
        assert_eq!(tool.live_objects(), 0);
    }

    #[tokio::test]
    async fn test_release_failure_keeps_outcome() {
        let tool = Arc::new(FakeSnapshotTool::failing(&["unmount"]));
        let (runner, _) = runner(&tool);

        let job = job("archive", "true").with_snapshot("/srv/media", "/mnt/media");
        assert_eq!(runner.run(&job).await, JobOutcome::Success);

        runner.reporter().flush().await;
        let snapshot = runner.reporter().snapshot();
        assert_eq!(snapshot.jobs["archive"].release_errors, 1);
        assert!(snapshot.failed_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_job_fails() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, _) = runner(&tool);

        let cancel = runner.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let job = job("replicate", "sleep 30").with_snapshot("/srv/data", "/mnt/data");
        assert_eq!(runner.run(&job).await, JobOutcome::Failure("cancelled".into()));
        assert_eq!(tool.live_objects(), 0);
    }

    async fn settle(tool: &FakeSnapshotTool, leases: &LeaseManager) {
        for _ in 0..300 {
            if tool.live_objects() == 0 && leases.leases().iter().all(|l| l.state == crate::snapshot::LeaseState::Released) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_slow_lease_counts_against_timeout() {
        let tool = Arc::new(FakeSnapshotTool::slow(Duration::from_millis(700)));
        let (runner, leases) = runner(&tool);
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran");

        let job = job("replicate", &format!("touch {}; sleep 30", marker.display()))
            .with_snapshot("/srv/data", "/mnt/data");
        let start = Instant::now();
        let outcome = runner.run_with_timeout(&job, Duration::from_millis(500)).await;
        assert_eq!(outcome, JobOutcome::Timeout);
        assert!(start.elapsed() < Duration::from_millis(1500), "took {:?}", start.elapsed());
        assert!(!marker.exists());

        // The late lease is torn down in the background.
        settle(&tool, &leases).await;
        assert_eq!(tool.live_objects(), 0);
        assert!(leases.mounted_at(std::path::Path::new("/mnt/data")).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_job_timeout_leaves_no_mount() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, leases) = runner(&tool);

        let job = job("replicate", "sleep 30").with_snapshot("/srv/data", "/mnt/data");
        let start = Instant::now();
        let outcome = runner.run_with_timeout(&job, Duration::from_millis(300)).await;
        assert_eq!(outcome, JobOutcome::Timeout);
        assert!(start.elapsed() < Duration::from_secs(3));

        assert_eq!(tool.live_objects(), 0);
        assert!(leases.mounted_at(std::path::Path::new("/mnt/data")).is_empty());
        assert_eq!(tool.calls().last().map(String::as_str), Some("snapshot-destroy"));
    }

    #[tokio::test]
    async fn test_slow_release_is_bounded() {
        let tool = Arc::new(FakeSnapshotTool::slow(Duration::from_millis(150)));
        let (runner, leases) = runner(&tool);

        let job = job("archive", "true").with_snapshot("/srv/media", "/mnt/media");
        let start = Instant::now();
        assert_eq!(runner.run(&job).await, JobOutcome::Success);
        // 450ms to acquire, then at most the 200ms grace waiting on the release
        assert!(start.elapsed() < Duration::from_millis(1200), "took {:?}", start.elapsed());

        runner.reporter().flush().await;
        assert_eq!(runner.reporter().snapshot().jobs["archive"].release_errors, 1);

        settle(&tool, &leases).await;
        assert_eq!(tool.live_objects(), 0);
    }

    #[tokio::test]
    async fn test_reports_start_and_finish() {
        let tool = Arc::new(FakeSnapshotTool::new());
        let (runner, _) = runner(&tool);

        runner.run(&job("snap", "true")).await;
        runner.reporter().flush().await;

        let snapshot = runner.reporter().snapshot();
        assert_eq!(snapshot.sequence, 2);
        assert!(snapshot.jobs["snap"].last_success.is_some());
    }
}
