//! Stage Orchestrator.
//!
//! Stages run strictly in order. All jobs of a stage run concurrently, each
//! on its own task, and the stage settles only once every job has an
//! outcome. A failed critical job, a cancellation or an expired run
//! deadline aborts the run: later stages are never started.

pub mod plan;

use crate::executor::job::{BackupJob, JobOutcome};
use crate::executor::JobRunner;
use crate::report::ReportEvent;
use chrono::{DateTime, Utc};
use plan::{Stage, StagePlan};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL_FAILURE: i32 = 1;
pub const EXIT_ABORTED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    /// Index into the plan's stages
    Running(usize),
    Settled,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Critical jobs that did not succeed
    CriticalFailure(Vec<String>),
    Cancelled,
    DeadlineExceeded,
}

/// Exactly one outcome per job of the stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub job_results: BTreeMap<String, JobOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn failed(&self) -> usize {
        self.job_results.values().filter(|o| !o.is_success()).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageResult>,
    /// Stages never started, with their jobs
    pub skipped: Vec<(String, Vec<String>)>,
    pub state: RunState,
    pub abort_reason: Option<AbortReason>,
    pub exit_code: i32,
}

impl RunReport {
    pub fn aborted(&self) -> bool {
        self.state == RunState::Aborted
    }

    /// Failed jobs with their outcome, in stage order
    pub fn failures(&self) -> Vec<(&str, &JobOutcome)> {
        self.stages
            .iter()
            .flat_map(|s| s.job_results.iter())
            .filter(|(_, o)| !o.is_success())
            .map(|(name, o)| (name.as_str(), o))
            .collect()
    }
}

pub struct Orchestrator {
    runner: JobRunner,
    deadline: Option<Duration>,
    state: RunState,
}

impl Orchestrator {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner,
            deadline: None,
            state: RunState::Pending,
        }
    }

    /// Bound the whole run, measured from the start of [`Orchestrator::run`].
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub async fn run(&mut self, plan: &StagePlan) -> RunReport {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let reporter = self.runner.reporter().clone();
        let mut stages = Vec::new();
        let mut abort_reason = None;

        info!(
            stages = plan.stages().len(),
            jobs = plan.job_count(),
            "Starting backup run"
        );

        for (index, stage) in plan.stages().iter().enumerate() {
            if self.runner.cancel_token().is_cancelled() {
                abort_reason = Some(AbortReason::Cancelled);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(stage = %stage.key, "Run deadline passed before stage start");
                abort_reason = Some(AbortReason::DeadlineExceeded);
                break;
            }

            self.state = RunState::Running(index);
            let result = self.run_stage(stage, deadline).await;
            reporter.flush().await;
            reporter.record(ReportEvent::StageSettled {
                stage: stage.key.clone(),
                failed: result.failed(),
                total: result.job_results.len(),
            });

            let critical_failures: Vec<String> = stage
                .jobs
                .iter()
                .filter(|j| j.critical)
                .filter(|j| !result.job_results.get(&j.name).is_some_and(JobOutcome::is_success))
                .map(|j| j.name.clone())
                .collect();
            stages.push(result);

            if !critical_failures.is_empty() {
                error!(stage = %stage.key, jobs = ?critical_failures, "Critical job failed, aborting run");
                abort_reason = Some(AbortReason::CriticalFailure(critical_failures));
                break;
            }
            if self.runner.cancel_token().is_cancelled() {
                abort_reason = Some(AbortReason::Cancelled);
                break;
            }
        }

        let skipped: Vec<(String, Vec<String>)> = plan.stages()[stages.len()..]
            .iter()
            .map(|s| (s.key.clone(), s.job_names()))
            .collect();
        for (stage, jobs) in &skipped {
            info!(%stage, jobs = jobs.len(), "Stage skipped");
            reporter.record(ReportEvent::StageSkipped {
                stage: stage.clone(),
                jobs: jobs.clone(),
            });
        }

        self.state = if abort_reason.is_some() {
            RunState::Aborted
        } else {
            RunState::Settled
        };

        let exit_code = if abort_reason.is_some() {
            EXIT_ABORTED
        } else if stages.iter().any(|s| s.failed() > 0) {
            EXIT_PARTIAL_FAILURE
        } else {
            EXIT_SUCCESS
        };

        reporter.record(ReportEvent::RunFinished { exit_code });
        reporter.flush().await;
        info!(exit_code, state = ?self.state, "Backup run finished");

        RunReport {
            stages,
            skipped,
            state: self.state,
            abort_reason,
            exit_code,
        }
    }

    async fn run_stage(&self, stage: &Stage, deadline: Option<Instant>) -> StageResult {
        let started_at = Utc::now();
        info!(stage = %stage.key, jobs = stage.jobs.len(), "Stage started");
        self.runner.reporter().record(ReportEvent::StageStarted {
            stage: stage.key.clone(),
            jobs: stage.jobs.len(),
        });

        let mut tasks = JoinSet::new();
        for job in &stage.jobs {
            let runner = self.runner.clone();
            let job = job.clone();
            let timeout = effective_timeout(&job, deadline);
            tasks.spawn(async move {
                let outcome = runner.run_with_timeout(&job, timeout).await;
                (job.name, outcome)
            });
        }

        let mut job_results = BTreeMap::new();
        let mut task_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    job_results.insert(name, outcome);
                }
                Err(e) => {
                    error!(stage = %stage.key, error = %e, "Job task failed");
                    task_error = Some(e.to_string());
                }
            }
        }

        // A task that died without an outcome still gets one.
        for job in &stage.jobs {
            if !job_results.contains_key(&job.name) {
                let reason = format!(
                    "job task failed: {}",
                    task_error.as_deref().unwrap_or("no outcome")
                );
                let outcome = JobOutcome::Failure(reason);
                self.runner
                    .reporter()
                    .job_finished(&job.name, &job.stage, outcome.clone(), Duration::ZERO);
                job_results.insert(job.name.clone(), outcome);
            }
        }

        StageResult {
            stage: stage.key.clone(),
            job_results,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn effective_timeout(job: &BackupJob, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(d) => job.timeout.min(d.saturating_duration_since(Instant::now())),
        None => job.timeout,
    }
}
