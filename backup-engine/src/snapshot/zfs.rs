//! ZFS implementation of [`SnapshotTool`] driving the `zfs` command line.

use super::{SnapshotTool, StepResult};
use crate::utils::SnapshotError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub struct ZfsTool {
    zfs_bin: PathBuf,
}

impl ZfsTool {
    pub fn new(zfs_bin: impl Into<PathBuf>) -> Self {
        Self {
            zfs_bin: zfs_bin.into(),
        }
    }

    fn zfs(&self, step: &'static str, args: &[&str]) -> StepResult<String> {
        debug!(step, ?args, "zfs");
        let output = Command::new(&self.zfs_bin)
            .args(args)
            .output()
            .map_err(|e| SnapshotError::new(step, format!("{}: {}", self.zfs_bin.display(), e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(SnapshotError::new(
                step,
                if stderr.is_empty() {
                    format!("zfs exited with {}", output.status)
                } else {
                    stderr
                },
            ))
        }
    }

    /// Run a teardown step, treating an already-absent object as done.
    fn zfs_teardown(&self, step: &'static str, args: &[&str]) -> StepResult<()> {
        match self.zfs(step, args) {
            Ok(_) => Ok(()),
            Err(e) if is_already_gone(&e.cause) => {
                debug!(step, cause = %e.cause, "Nothing to tear down");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_already_gone(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("not currently mounted")
}

/// A snapshot covers the whole dataset, so `source` must be its mountpoint.
fn check_mountpoint(source: &Path, dataset: &str, mountpoint: &str) -> StepResult<()> {
    if mountpoint.starts_with('/') && Path::new(mountpoint) == source {
        return Ok(());
    }
    Err(SnapshotError::new(
        "snapshot-create",
        format!(
            "{} is not the mountpoint of dataset {} (mountpoint {})",
            source.display(),
            dataset,
            mountpoint
        ),
    ))
}

/// The pool is the first component of a dataset name.
fn pool_of(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

impl SnapshotTool for ZfsTool {
    fn create_snapshot(&self, source: &Path, name: &str) -> StepResult<String> {
        let path = source.to_string_lossy();
        let dataset = self.zfs("snapshot-create", &["list", "-H", "-o", "name", &path])?;
        let dataset = dataset
            .lines()
            .next()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| SnapshotError::new("snapshot-create", format!("no dataset for {}", path)))?
            .to_string();

        let mountpoint = self.zfs("snapshot-create", &["get", "-H", "-o", "value", "mountpoint", &dataset])?;
        check_mountpoint(source, &dataset, mountpoint.trim())?;

        let snapshot = format!("{}@{}", dataset, name);
        self.zfs("snapshot-create", &["snapshot", &snapshot])?;
        Ok(snapshot)
    }

    fn create_clone(&self, snapshot: &str, name: &str) -> StepResult<String> {
        let dataset = snapshot.split('@').next().unwrap_or(snapshot);
        let clone = format!("{}/{}", pool_of(dataset), name);
        self.zfs(
            "clone-create",
            &[
                "clone",
                "-o",
                "readonly=on",
                "-o",
                "canmount=noauto",
                "-o",
                "mountpoint=none",
                snapshot,
                &clone,
            ],
        )?;
        Ok(clone)
    }

    fn mount_clone(&self, clone: &str, mount: &Path) -> StepResult<()> {
        let mountpoint = format!("mountpoint={}", mount.display());
        self.zfs("clone-mount", &["set", &mountpoint, clone])?;
        self.zfs("clone-mount", &["mount", clone])?;
        Ok(())
    }

    fn unmount_clone(&self, clone: &str, _mount: &Path) -> StepResult<()> {
        self.zfs_teardown("unmount", &["unmount", clone])
    }

    fn destroy_clone(&self, clone: &str) -> StepResult<()> {
        self.zfs_teardown("clone-destroy", &["destroy", clone])
    }

    fn destroy_snapshot(&self, snapshot: &str) -> StepResult<()> {
        self.zfs_teardown("snapshot-destroy", &["destroy", snapshot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_of() {
        assert_eq!(pool_of("tank/services/sonarr"), "tank");
        assert_eq!(pool_of("tank"), "tank");
    }

    #[test]
    fn test_already_gone_detection() {
        assert!(is_already_gone("cannot open 'tank/x': dataset does not exist"));
        assert!(is_already_gone("cannot unmount 'tank/x': not currently mounted"));
        assert!(!is_already_gone("cannot destroy 'tank/x': dataset is busy"));
    }

    #[test]
    fn test_missing_binary_reports_step() {
        let tool = ZfsTool::new("/nonexistent/zfs");
        let err = tool
            .create_snapshot(Path::new("/srv/data"), "backup-engine-1")
            .unwrap_err();
        assert_eq!(err.step, "snapshot-create");
    }

    #[test]
    fn test_check_mountpoint() {
        assert!(check_mountpoint(Path::new("/srv/data"), "tank/data", "/srv/data").is_ok());
        assert!(check_mountpoint(Path::new("/srv/data/"), "tank/data", "/srv/data").is_ok());

        let err = check_mountpoint(Path::new("/srv/data/media"), "tank/data", "/srv/data").unwrap_err();
        assert_eq!(err.step, "snapshot-create");
        assert!(err.cause.contains("/srv/data/media"));

        assert!(check_mountpoint(Path::new("/srv/data"), "tank/data", "legacy").is_err());
        assert!(check_mountpoint(Path::new("/srv/data"), "tank/data", "none").is_err());
    }

    /// Stand-in `zfs` that logs its arguments and maps everything under
    /// /srv/data to dataset tank/data.
    fn fake_zfs(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls");
        let script = dir.join("zfs");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> {}\ncase \"$1\" in\n  list) echo tank/data ;;\n  get) echo /srv/data ;;\nesac\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn test_subdirectory_source_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = ZfsTool::new(fake_zfs(dir.path()));

        let err = tool
            .create_snapshot(Path::new("/srv/data/media"), "backup-engine-1")
            .unwrap_err();
        assert_eq!(err.step, "snapshot-create");
        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert!(!calls.contains("snapshot tank/data@"), "{}", calls);

        let snapshot = tool
            .create_snapshot(Path::new("/srv/data"), "backup-engine-2")
            .unwrap();
        assert_eq!(snapshot, "tank/data@backup-engine-2");
    }
}
