//! Status/metrics reporter.
//!
//! A single aggregator task owns the outcome map. Job tasks send events
//! over a channel; readers get an immutable [`StatusSnapshot`] that is
//! swapped in whole after every event, and console printers receive every
//! event through a broadcast channel.

pub mod metrics;
pub mod state;
pub mod status;

use crate::executor::job::JobOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Maximum number of queued events per console subscriber
const BROADCAST_CAPACITY: usize = 1000;

/// Outcome of one restore method attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    FailedRecoverable,
    FailedFatal,
}

/// Terminal result of resolving one restore target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    Populated,
    EmptyInitialized,
}

impl RestoreOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RestoreOutcome::Populated => "populated",
            RestoreOutcome::EmptyInitialized => "empty_initialized",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReportEvent {
    JobStarted {
        job: String,
        stage: String,
        at: DateTime<Utc>,
    },
    JobFinished {
        job: String,
        stage: String,
        outcome: JobOutcome,
        duration: Duration,
        at: DateTime<Utc>,
    },
    /// Lease cleanup failed after the job's outcome was decided
    ReleaseFailed { job: String, error: String },
    StageStarted { stage: String, jobs: usize },
    StageSettled { stage: String, failed: usize, total: usize },
    /// A stage that was never started because the run aborted
    StageSkipped { stage: String, jobs: Vec<String> },
    RestoreAttempt {
        service: String,
        method: String,
        outcome: AttemptOutcome,
        duration: Duration,
    },
    RestoreFinished {
        service: String,
        outcome: RestoreOutcome,
        method: Option<String>,
        attempts: usize,
    },
    RunFinished { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Finished(JobOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub stage: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub last_success: Option<DateTime<Utc>>,
    pub release_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreStatus {
    pub outcome: RestoreOutcome,
    pub method: Option<String>,
    pub attempts: usize,
}

/// Point-in-time view of everything reported so far.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub jobs: BTreeMap<String, JobStatus>,
    /// Last success of jobs from earlier runs, keyed by job with its stage
    pub previous_success: BTreeMap<String, (String, DateTime<Utc>)>,
    pub restores: BTreeMap<String, RestoreStatus>,
    pub exit_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of events folded into this snapshot
    pub sequence: u64,
}

impl StatusSnapshot {
    /// Jobs whose latest outcome is not success
    pub fn failed_jobs(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, s)| matches!(&s.state, JobState::Finished(o) if !o.is_success()))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn running_jobs(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, s)| s.state == JobState::Running)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn apply(&mut self, event: &ReportEvent) {
        match event {
            ReportEvent::JobStarted { job, stage, at } => {
                let last_success = self
                    .jobs
                    .get(job)
                    .and_then(|s| s.last_success)
                    .or_else(|| self.previous_success.get(job).map(|(_, at)| *at));
                self.jobs.insert(
                    job.clone(),
                    JobStatus {
                        stage: stage.clone(),
                        state: JobState::Running,
                        started_at: *at,
                        finished_at: None,
                        duration: None,
                        last_success,
                        release_errors: 0,
                    },
                );
            }
            ReportEvent::JobFinished {
                job,
                stage,
                outcome,
                duration,
                at,
            } => {
                let status = self.jobs.entry(job.clone()).or_insert_with(|| JobStatus {
                    stage: stage.clone(),
                    state: JobState::Running,
                    started_at: *at,
                    finished_at: None,
                    duration: None,
                    last_success: self.previous_success.get(job).map(|(_, at)| *at),
                    release_errors: 0,
                });
                status.state = JobState::Finished(outcome.clone());
                status.finished_at = Some(*at);
                status.duration = Some(*duration);
                if outcome.is_success() {
                    status.last_success = Some(*at);
                }
            }
            ReportEvent::ReleaseFailed { job, .. } => {
                if let Some(status) = self.jobs.get_mut(job) {
                    status.release_errors += 1;
                }
            }
            ReportEvent::RestoreFinished {
                service,
                outcome,
                method,
                attempts,
            } => {
                self.restores.insert(
                    service.clone(),
                    RestoreStatus {
                        outcome: *outcome,
                        method: method.clone(),
                        attempts: *attempts,
                    },
                );
            }
            ReportEvent::RunFinished { exit_code } => {
                self.exit_code = Some(*exit_code);
                self.finished_at = Some(Utc::now());
            }
            ReportEvent::StageStarted { .. }
            | ReportEvent::StageSettled { .. }
            | ReportEvent::StageSkipped { .. }
            | ReportEvent::RestoreAttempt { .. } => {}
        }
        self.sequence += 1;
    }
}

enum Command {
    Event(ReportEvent),
    Flush(oneshot::Sender<()>),
}

/// Reporter before its aggregator task is started.
pub struct Reporter {
    initial: StatusSnapshot,
    events: broadcast::Sender<ReportEvent>,
}

impl Reporter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            initial: StatusSnapshot::default(),
            events,
        }
    }

    /// Seed last-success timestamps carried over from earlier runs.
    pub fn with_history(mut self, history: &state::PersistedState) -> Self {
        for (name, job) in &history.jobs {
            if let Some(last_success) = job.last_success() {
                self.initial
                    .previous_success
                    .insert(name.clone(), (job.stage.clone(), last_success));
            }
        }
        self
    }

    /// Console subscription; the stream ends once the aggregator stops.
    pub fn subscribe(&self) -> broadcast::Receiver<ReportEvent> {
        self.events.subscribe()
    }

    /// Start the aggregator. It stops when every handle has been dropped
    /// and resolves to the final snapshot.
    pub fn spawn(self) -> (ReporterHandle, JoinHandle<Arc<StatusSnapshot>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(self.initial.clone()));
        let events = self.events;
        let mut current = self.initial;

        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Event(event) => {
                        current.apply(&event);
                        snapshot_tx.send_replace(Arc::new(current.clone()));
                        // No subscribers is fine
                        let _ = events.send(event);
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(events = current.sequence, "Reporter stopped");
            Arc::new(current)
        });

        (
            ReporterHandle {
                tx,
                snapshot: snapshot_rx,
            },
            task,
        )
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap, cloneable sender side of the reporter.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Arc<StatusSnapshot>>,
}

impl ReporterHandle {
    pub fn record(&self, event: ReportEvent) {
        if self.tx.send(Command::Event(event)).is_err() {
            debug!("Reporter already stopped, event dropped");
        }
    }

    pub fn job_started(&self, job: &str, stage: &str) {
        self.record(ReportEvent::JobStarted {
            job: job.to_string(),
            stage: stage.to_string(),
            at: Utc::now(),
        });
    }

    pub fn job_finished(&self, job: &str, stage: &str, outcome: JobOutcome, duration: Duration) {
        self.record(ReportEvent::JobFinished {
            job: job.to_string(),
            stage: stage.to_string(),
            outcome,
            duration,
            at: Utc::now(),
        });
    }

    /// Wait until every event sent before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Latest consistent snapshot.
    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Receiver woken on every applied event. Closes with the aggregator.
    pub fn watch_snapshots(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.snapshot.clone()
    }
}
