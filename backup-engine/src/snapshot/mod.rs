//! Point-in-time snapshots of live volumes.
//!
//! The engine never copies data itself: it sequences the external snapshot
//! tool's create/clone/mount calls and their reverse on release.

pub mod lease;
pub mod zfs;

#[cfg(test)]
pub(crate) mod fake;

pub use lease::{LeaseGuard, LeaseManager, LeaseState, SnapshotLease};
pub use zfs::ZfsTool;

use crate::utils::SnapshotError;
use std::path::Path;

pub type StepResult<T> = std::result::Result<T, SnapshotError>;

/// Synchronous operations offered by the external snapshot tool.
///
/// Every call may block on a subprocess; callers run them on a blocking
/// thread owned by the job that requested the lease.
pub trait SnapshotTool: Send + Sync {
    /// Snapshot the volume behind `source`, returning the snapshot identifier.
    fn create_snapshot(&self, source: &Path, name: &str) -> StepResult<String>;

    /// Create an independently mountable clone of `snapshot`.
    fn create_clone(&self, snapshot: &str, name: &str) -> StepResult<String>;

    fn mount_clone(&self, clone: &str, mount: &Path) -> StepResult<()>;

    fn unmount_clone(&self, clone: &str, mount: &Path) -> StepResult<()>;

    fn destroy_clone(&self, clone: &str) -> StepResult<()>;

    fn destroy_snapshot(&self, snapshot: &str) -> StepResult<()>;
}
