//! Restore method backed by an external program.

use super::RestoreMethod;
use crate::exec::{run_with_deadline, ExecStatus};
use crate::executor::job::CommandSpec;
use crate::report::AttemptOutcome;
use crate::utils::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Placeholder replaced by the restore target directory.
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Exit code of a shell that could not find the program.
const EXIT_NOT_FOUND: i32 = 127;

pub struct CommandMethod {
    name: String,
    command: CommandSpec,
    timeout: Duration,
    kill_grace: Duration,
    cancel: CancellationToken,
}

impl CommandMethod {
    pub fn new(name: &str, command: CommandSpec, timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            name: name.to_string(),
            command,
            timeout,
            kill_grace,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop a running attempt when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl RestoreMethod for CommandMethod {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, target: &Path) -> Result<AttemptOutcome> {
        let target_str = target.to_string_lossy();
        let args: Vec<String> = self
            .command
            .args
            .iter()
            .map(|a| a.replace(TARGET_PLACEHOLDER, &target_str))
            .collect();

        let status = run_with_deadline(
            &self.command.program,
            &args,
            Some(target),
            self.timeout,
            self.kill_grace,
            &self.cancel,
        )
        .await;
        debug!(method = %self.name, ?status, "Restore command finished");

        Ok(match status {
            ExecStatus::Exited(Some(0)) => AttemptOutcome::Success,
            ExecStatus::Exited(Some(EXIT_NOT_FOUND)) => {
                warn!(method = %self.name, program = %self.command.program, "Restore tool not found");
                AttemptOutcome::FailedFatal
            }
            ExecStatus::SpawnFailed(e) => {
                warn!(method = %self.name, error = %e, "Restore tool could not be started");
                AttemptOutcome::FailedFatal
            }
            ExecStatus::Exited(_) | ExecStatus::TimedOut | ExecStatus::Cancelled => {
                AttemptOutcome::FailedRecoverable
            }
        })
    }
}
