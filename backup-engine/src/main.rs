//! Backup Engine - Main entry point
//!
//! `run` executes the staged backup jobs, `restore` repopulates service
//! data directories, `status` shows the recorded job history.

use anyhow::{Context, Result};
use backup_engine::config::Config;
use backup_engine::daemon::{RunLock, ShutdownCoordinator};
use backup_engine::executor::job::JobOutcome;
use backup_engine::executor::JobRunner;
use backup_engine::orchestrator::plan::StagePlan;
use backup_engine::orchestrator::{Orchestrator, RunReport};
use backup_engine::report::metrics::MetricsExporter;
use backup_engine::report::state::PersistedState;
use backup_engine::report::status::StatusReport;
use backup_engine::report::{ReportEvent, Reporter, RestoreOutcome, StatusSnapshot};
use backup_engine::restore::Resolver;
use backup_engine::snapshot::{LeaseManager, ZfsTool};
use backup_engine::utils::format::{format_bytes, format_duration};
use backup_engine::{utils, EngineError};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_CONFIG: &str = "/etc/backup-engine/config.toml";

const EXIT_CONFIG: u8 = 3;
const EXIT_ALREADY_RUNNING: u8 = 4;
const EXIT_INTERNAL: u8 = 5;

/// Minimum spacing of metric exports while a run is in progress
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every backup stage in order
    Run,
    /// Restore empty service data directories
    Restore {
        /// Only this service (default: every configured service)
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Show the last recorded outcome of every job
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("backup-engine: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level, &config.log.format) {
        eprintln!("backup-engine: {:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let result = match args.command {
        Command::Run => run(&config).await,
        Command::Restore { service } => restore(&config, service.as_deref()).await,
        Command::Status { json } => status(&config, json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("backup-engine: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::from_file(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(Config::from_file(Path::new(DEFAULT_CONFIG))?),
        None => Ok(Config::default()),
    }
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::Config(_)) | Some(EngineError::Validation(_)) => EXIT_CONFIG,
        Some(EngineError::AlreadyRunning(_)) => EXIT_ALREADY_RUNNING,
        _ => EXIT_INTERNAL,
    }
}

async fn run(config: &Config) -> Result<u8> {
    let plan = StagePlan::build(config.backup_jobs()?, &config.run.stages)?;
    let _lock = RunLock::acquire(&config.state.dir)?;

    tracing::info!(
        "Starting backup-engine v{} ({} jobs in {} stages)",
        env!("CARGO_PKG_VERSION"),
        plan.job_count(),
        plan.stages().len()
    );

    let state_path = PersistedState::path_in(&config.state.dir);
    let mut history = PersistedState::load(&state_path).unwrap_or_else(|e| {
        tracing::warn!(path = %state_path.display(), error = %e, "Ignoring unreadable status history");
        PersistedState::default()
    });

    let reporter = Reporter::new().with_history(&history);
    let printer = tokio::spawn(print_events(reporter.subscribe()));
    let (handle, aggregator) = reporter.spawn();
    let exporter = metrics_exporter(config, "backup-engine");
    let follower = exporter.clone().follow(handle.watch_snapshots(), METRICS_INTERVAL);

    let (cancel, signals) = ShutdownCoordinator::new().spawn();

    let tool = Arc::new(ZfsTool::new(config.snapshot.zfs_bin.clone()));
    let leases = Arc::new(LeaseManager::new(tool, config.snapshot.prefix.clone()));
    let runner = JobRunner::new(leases, handle, config.kill_grace(), cancel.clone());

    let mut orchestrator = Orchestrator::new(runner).with_deadline(config.run_deadline());
    let report = orchestrator.run(&plan).await;
    drop(orchestrator);

    let snapshot = aggregator.await.context("reporter task failed")?;
    let _ = printer.await;
    follower.abort();
    let _ = follower.await;
    cancel.cancel();
    let _ = signals.await;

    print_summary(&report);

    history.merge(&snapshot);
    if let Err(e) = history.save(&state_path) {
        tracing::warn!(path = %state_path.display(), error = %e, "Failed to persist status history");
    }
    export_metrics(&exporter, &snapshot).await;

    Ok(report.exit_code as u8)
}

async fn restore(config: &Config, service: Option<&str>) -> Result<u8> {
    let services: Vec<_> = match service {
        Some(name) => vec![config
            .restore_service(name)
            .ok_or_else(|| EngineError::Config(format!("no restore configuration for service {}", name)))?],
        None => config.restore.iter().collect(),
    };

    let (cancel, signals) = ShutdownCoordinator::new().spawn();

    // Validate everything, owners included, before touching any directory.
    let mut prepared = Vec::new();
    for svc in services {
        let methods = svc.to_methods(config.kill_grace(), &cancel);
        let longest = svc.methods.iter().map(|m| m.timeout_secs).max().unwrap_or(0);
        let attempt_timeout = Duration::from_secs(longest) + config.kill_grace() * 2 + Duration::from_secs(5);
        prepared.push((svc.service.clone(), svc.to_target()?, methods, attempt_timeout));
    }

    let reporter = Reporter::new();
    let printer = tokio::spawn(print_events(reporter.subscribe()));
    let (handle, aggregator) = reporter.spawn();
    let exporter = metrics_exporter(config, "backup-engine-restore");
    let follower = exporter.clone().follow(handle.watch_snapshots(), METRICS_INTERVAL);

    // One service failing does not keep the others from being restored.
    let mut first_error = None;
    for (service, target, methods, attempt_timeout) in prepared {
        if cancel.is_cancelled() {
            tracing::warn!(%service, "Restore cancelled, service not attempted");
            if first_error.is_none() {
                first_error = Some(anyhow::anyhow!("restore cancelled before {}", service));
            }
            continue;
        }

        let result = Resolver::new()
            .with_reporter(handle.clone())
            .with_attempt_timeout(attempt_timeout)
            .with_cancel(cancel.clone())
            .resolve(&service, &target, &methods)
            .await;

        match result {
            Ok(resolution) => {
                if resolution.outcome == RestoreOutcome::Populated && resolution.method.is_some() {
                    println!(
                        "{}: restored {} files ({})",
                        service,
                        resolution.stats.files,
                        format_bytes(resolution.stats.bytes)
                    );
                }
            }
            Err(e) => {
                tracing::error!(%service, error = %e, "Restore failed");
                eprintln!("{}: restore failed: {}", service, e);
                if first_error.is_none() {
                    first_error = Some(anyhow::Error::new(e).context(format!("restore of {}", service)));
                }
            }
        }
    }

    drop(handle);
    let snapshot = aggregator.await.context("reporter task failed")?;
    let _ = printer.await;
    follower.abort();
    let _ = follower.await;
    cancel.cancel();
    let _ = signals.await;
    export_metrics(&exporter, &snapshot).await;

    match first_error {
        Some(e) => Err(e),
        None => Ok(0),
    }
}

fn status(config: &Config, json: bool) -> Result<u8> {
    let state = PersistedState::load(&PersistedState::path_in(&config.state.dir))?;
    let stale_after = Duration::from_secs(config.state.stale_after_hours * 3600);
    let report = StatusReport::build(&state, stale_after, chrono::Utc::now());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }

    Ok(if report.rows.is_empty() { 1 } else { 0 })
}

fn metrics_exporter(config: &Config, job: &str) -> MetricsExporter {
    MetricsExporter::new(
        config.metrics.textfile_dir.as_deref(),
        config.metrics.push_gateway.clone(),
        job,
        config.instance_name(),
    )
}

async fn export_metrics(exporter: &MetricsExporter, snapshot: &StatusSnapshot) {
    if let Err(e) = exporter.export(snapshot).await {
        tracing::warn!(error = %e, "Failed to render metrics");
    }
}

/// Operator console: one line per job start and outcome.
async fn print_events(mut events: broadcast::Receiver<ReportEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                println!("... {} events not shown", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let ts = Local::now().format("%H:%M:%S");
        match event {
            ReportEvent::JobStarted { job, stage, .. } => {
                println!("[{}] START   {} (stage {})", ts, job, stage);
            }
            ReportEvent::JobFinished {
                job,
                outcome,
                duration,
                ..
            } => {
                let took = format_duration(duration);
                match outcome {
                    JobOutcome::Success => println!("[{}] OK      {} ({})", ts, job, took),
                    JobOutcome::Timeout => println!("[{}] TIMEOUT {} ({})", ts, job, took),
                    JobOutcome::Failure(reason) => {
                        println!("[{}] FAILED  {} ({}): {}", ts, job, took, reason)
                    }
                }
            }
            ReportEvent::ReleaseFailed { job, error } => {
                println!("[{}] WARN    {}: snapshot release failed: {}", ts, job, error);
            }
            ReportEvent::StageSkipped { stage, jobs } => {
                println!("[{}] SKIP    stage {}: {}", ts, stage, jobs.join(", "));
            }
            ReportEvent::RestoreAttempt {
                service,
                method,
                outcome,
                duration,
            } => {
                println!(
                    "[{}] RESTORE {} via {}: {:?} ({})",
                    ts,
                    service,
                    method,
                    outcome,
                    format_duration(duration)
                );
            }
            ReportEvent::RestoreFinished {
                service,
                outcome,
                method,
                attempts,
            } => match method {
                Some(method) => println!("[{}] RESTORE {}: {} by {}", ts, service, outcome.label(), method),
                None => println!(
                    "[{}] RESTORE {}: {} after {} attempts",
                    ts,
                    service,
                    outcome.label(),
                    attempts
                ),
            },
            ReportEvent::StageStarted { .. }
            | ReportEvent::StageSettled { .. }
            | ReportEvent::RunFinished { .. } => {}
        }
    }
}

fn print_summary(report: &RunReport) {
    let total: usize = report.stages.iter().map(|s| s.job_results.len()).sum();
    let failures = report.failures();

    println!();
    println!(
        "Summary: {} of {} jobs succeeded, {} stage(s) skipped, exit code {}",
        total - failures.len(),
        total,
        report.skipped.len(),
        report.exit_code
    );
    for (job, outcome) in failures {
        println!("  {}: {}", job, outcome);
    }
    if let Some(reason) = &report.abort_reason {
        println!("  run aborted: {:?}", reason);
    }
}
