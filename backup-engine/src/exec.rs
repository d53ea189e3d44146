//! Subprocess execution bounded by a deadline.
//!
//! Every command runs in its own process group so that a timeout or a
//! cancellation terminates the whole subtree, not only the direct child.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Placeholder in command arguments replaced by the resolved input path.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Environment variable carrying the resolved input path.
pub const INPUT_PATH_ENV: &str = "BACKUP_INPUT_PATH";

/// How a command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    /// Process exited on its own; `None` if it was killed by a signal.
    Exited(Option<i32>),
    /// Deadline elapsed and the process group was terminated.
    TimedOut,
    /// Cancellation was requested and the process group was terminated.
    Cancelled,
    /// The program could not be started at all.
    SpawnFailed(String),
}

/// Run `program args...` with `input` substituted, racing exit against
/// `deadline` and `cancel`.
pub async fn run_with_deadline(
    program: &str,
    args: &[String],
    input: Option<&Path>,
    deadline: Duration,
    kill_grace: Duration,
    cancel: &CancellationToken,
) -> ExecStatus {
    let mut cmd = Command::new(program);
    cmd.args(substitute(args, input))
        .stdin(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(path) = input {
        cmd.env(INPUT_PATH_ENV, path);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ExecStatus::SpawnFailed(format!("{}: {}", program, e)),
    };
    let pid = child.id();
    debug!(program, pid, "Spawned command");

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExecStatus::Exited(status.code()),
            Err(e) => ExecStatus::SpawnFailed(format!("{}: wait failed: {}", program, e)),
        },
        _ = tokio::time::sleep(deadline) => {
            warn!(program, pid, ?deadline, "Deadline exceeded, terminating process group");
            terminate_group(&mut child, pid, kill_grace).await;
            ExecStatus::TimedOut
        }
        _ = cancel.cancelled() => {
            warn!(program, pid, "Cancelled, terminating process group");
            terminate_group(&mut child, pid, kill_grace).await;
            ExecStatus::Cancelled
        }
    }
}

/// Replace the path placeholder in each argument.
pub fn substitute(args: &[String], input: Option<&Path>) -> Vec<String> {
    match input {
        Some(path) => {
            let path = path.to_string_lossy();
            args.iter()
                .map(|a| a.replace(PATH_PLACEHOLDER, &path))
                .collect()
        }
        None => args.to_vec(),
    }
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL and reap.
async fn terminate_group(child: &mut Child, pid: Option<u32>, grace: Duration) {
    let Some(pid) = pid else {
        // Already reaped
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM to process group failed");
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        // Leader is gone; stragglers in the group still get SIGKILL below.
        let _ = killpg(pgid, Signal::SIGKILL);
        return;
    }

    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!(pid, error = %e, "SIGKILL to process group failed");
    }
    if let Err(e) = child.wait().await {
        warn!(pid, error = %e, "Failed to reap terminated process");
    }
}
