//! Restore Strategy Resolver.
//!
//! Repopulates an empty service data directory on first start by trying
//! restore methods in priority order. A target that already has content is
//! left alone; a target no method could restore is created empty so the
//! service can initialize itself.

pub mod command;
pub mod target;

pub use target::{ContentStats, RestoreTarget};

use crate::report::{AttemptOutcome, ReportEvent, ReporterHandle, RestoreOutcome};
use crate::utils::{EngineError, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound for one attempt when the method has no tighter one
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// One way of repopulating a data directory.
#[async_trait]
pub trait RestoreMethod: Send + Sync {
    fn name(&self) -> &str;

    /// Restore into `target`, an existing empty directory.
    async fn attempt(&self, target: &Path) -> Result<AttemptOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub method: String,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: RestoreOutcome,
    /// Method that populated the target; `None` if it already had content
    /// or was initialized empty
    pub method: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub stats: ContentStats,
}

pub struct Resolver {
    reporter: Option<ReporterHandle>,
    attempt_timeout: Duration,
    cancel: CancellationToken,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            reporter: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: ReporterHandle) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Stop before the next method once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn resolve(
        &self,
        service: &str,
        target: &RestoreTarget,
        methods: &[Arc<dyn RestoreMethod>],
    ) -> Result<Resolution> {
        if target.is_populated()? {
            info!(%service, target = %target.path().display(), "Target already populated, nothing to restore");
            return Ok(self.finish(service, RestoreOutcome::Populated, None, Vec::new(), target.content_stats()));
        }

        info!(%service, target = %target.path().display(), methods = methods.len(), "Restoring");
        // Unknown owner or group fails here, before any method runs.
        target.initialize_empty()?;

        let mut attempts = Vec::new();
        for method in methods {
            if self.cancel.is_cancelled() {
                warn!(%service, attempts = attempts.len(), "Restore cancelled");
                return Err(EngineError::Task(format!("restore of {} cancelled", service)));
            }

            let record = self.try_method(service, target, method.as_ref()).await;
            let succeeded = record.outcome == AttemptOutcome::Success;
            attempts.push(record);

            if succeeded {
                let stats = target.content_stats();
                info!(
                    %service,
                    method = method.name(),
                    files = stats.files,
                    bytes = stats.bytes,
                    "Restore succeeded"
                );
                let name = method.name().to_string();
                return Ok(self.finish(service, RestoreOutcome::Populated, Some(name), attempts, stats));
            }

            // Never hand the next method, or the service, a half-restored directory.
            target.clear().map_err(|e| {
                EngineError::Io(io::Error::new(
                    e.kind(),
                    format!("clearing {} after {}: {}", target.path().display(), method.name(), e),
                ))
            })?;
        }

        if self.cancel.is_cancelled() {
            return Err(EngineError::Task(format!("restore of {} cancelled", service)));
        }

        warn!(%service, attempts = attempts.len(), "All restore methods failed, initializing empty target");
        if target.is_populated()? {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not empty after failed restores", target.path().display()),
            )));
        }
        target.initialize_empty()?;
        Ok(self.finish(
            service,
            RestoreOutcome::EmptyInitialized,
            None,
            attempts,
            ContentStats::default(),
        ))
    }

    async fn try_method(&self, service: &str, target: &RestoreTarget, method: &dyn RestoreMethod) -> AttemptRecord {
        let start = Instant::now();
        let attempt = AssertUnwindSafe(method.attempt(target.path())).catch_unwind();

        let outcome = match tokio::time::timeout(self.attempt_timeout, attempt).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => {
                warn!(%service, method = method.name(), error = %e, "Restore method errored");
                AttemptOutcome::FailedRecoverable
            }
            Ok(Err(_)) => {
                warn!(%service, method = method.name(), "Restore method panicked");
                AttemptOutcome::FailedRecoverable
            }
            Err(_) => {
                warn!(%service, method = method.name(), timeout = ?self.attempt_timeout, "Restore method timed out");
                AttemptOutcome::FailedRecoverable
            }
        };

        let duration = start.elapsed();
        info!(%service, method = method.name(), ?outcome, ?duration, "Restore attempt finished");
        if let Some(reporter) = &self.reporter {
            reporter.record(ReportEvent::RestoreAttempt {
                service: service.to_string(),
                method: method.name().to_string(),
                outcome,
                duration,
            });
        }

        AttemptRecord {
            method: method.name().to_string(),
            outcome,
            duration,
        }
    }

    fn finish(
        &self,
        service: &str,
        outcome: RestoreOutcome,
        method: Option<String>,
        attempts: Vec<AttemptRecord>,
        stats: ContentStats,
    ) -> Resolution {
        if let Some(reporter) = &self.reporter {
            reporter.record(ReportEvent::RestoreFinished {
                service: service.to_string(),
                outcome,
                method: method.clone(),
                attempts: attempts.len(),
            });
        }
        Resolution {
            outcome,
            method,
            attempts,
            stats,
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
