//! Snapshot leases: one consistent, mounted copy per job invocation.
//!
//! A lease moves `Requested -> Created -> Mounted -> Released`, or
//! `Requested -> Failed` when acquisition cannot complete. Acquisition
//! failures tear down whatever was created before returning.

use super::SnapshotTool;
use crate::utils::{EngineError, ReleaseError, Result, SnapshotError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Requested,
    Created,
    Mounted,
    Released,
    Failed,
}

impl LeaseState {
    fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Released | LeaseState::Failed)
    }
}

/// Ownership record of one snapshot/clone pair.
#[derive(Debug, Clone)]
pub struct SnapshotLease {
    pub id: String,
    pub source_path: PathBuf,
    pub mount_path: PathBuf,
    pub state: LeaseState,
    /// Snapshot identifier, cleared once destroyed
    snapshot: Option<String>,
    /// Clone identifier, cleared once destroyed
    clone: Option<String>,
    /// Clone currently mounted at `mount_path`
    mounted: Option<String>,
}

/// Sequences snapshot tool calls and keeps the record of every lease.
pub struct LeaseManager {
    tool: Arc<dyn SnapshotTool>,
    prefix: String,
    // Short, non-async critical sections only.
    leases: Mutex<HashMap<String, SnapshotLease>>,
}

impl LeaseManager {
    pub fn new(tool: Arc<dyn SnapshotTool>, prefix: impl Into<String>) -> Self {
        Self {
            tool,
            prefix: prefix.into(),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, SnapshotLease>> {
        // A poisoned map is still a consistent set of records.
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self, lease: &SnapshotLease) {
        self.registry().insert(lease.id.clone(), lease.clone());
    }

    /// Create a snapshot of `source`, clone it and mount the clone at `mount`.
    ///
    /// Blocking. Fails with [`EngineError::LeaseConflict`] if another live
    /// lease already owns `mount`.
    pub fn acquire(&self, source: &Path, mount: &Path) -> Result<SnapshotLease> {
        let mut lease = {
            let mut leases = self.registry();
            if let Some(holder) = leases
                .values()
                .find(|l| l.mount_path == mount && !l.state.is_terminal())
            {
                return Err(EngineError::LeaseConflict {
                    mount: mount.display().to_string(),
                    holder: holder.id.clone(),
                });
            }

            let lease = SnapshotLease {
                id: uuid::Uuid::new_v4().simple().to_string(),
                source_path: source.to_path_buf(),
                mount_path: mount.to_path_buf(),
                state: LeaseState::Requested,
                snapshot: None,
                clone: None,
                mounted: None,
            };
            leases.insert(lease.id.clone(), lease.clone());
            lease
        };

        match self.build(&mut lease) {
            Ok(()) => {
                lease.state = LeaseState::Mounted;
                self.store(&lease);
                info!(lease = %lease.id, source = %source.display(), mount = %mount.display(), "Snapshot lease mounted");
                Ok(lease)
            }
            Err(e) => {
                warn!(lease = %lease.id, source = %source.display(), error = %e, "Snapshot lease acquisition failed");
                if let Err(cleanup) = self.teardown(&mut lease) {
                    warn!(lease = %lease.id, error = %cleanup, "Cleanup after failed acquisition incomplete");
                }
                lease.state = LeaseState::Failed;
                self.store(&lease);
                Err(e.into())
            }
        }
    }

    fn build(&self, lease: &mut SnapshotLease) -> std::result::Result<(), SnapshotError> {
        let name = format!("{}-{}", self.prefix, lease.id);

        let snapshot = self.tool.create_snapshot(&lease.source_path, &name)?;
        lease.snapshot = Some(snapshot.clone());
        self.store(lease);

        let clone = self.tool.create_clone(&snapshot, &name)?;
        lease.clone = Some(clone.clone());
        lease.state = LeaseState::Created;
        self.store(lease);

        self.tool.mount_clone(&clone, &lease.mount_path)?;
        lease.mounted = Some(clone);
        Ok(())
    }

    /// Unmount, destroy the clone and destroy the snapshot, in that order.
    ///
    /// Every step is attempted even if an earlier one fails; steps that
    /// succeeded are not repeated on a later call.
    fn teardown(&self, lease: &mut SnapshotLease) -> std::result::Result<(), ReleaseError> {
        let mut failures = Vec::new();

        if let Some(clone) = lease.mounted.clone() {
            match self.tool.unmount_clone(&clone, &lease.mount_path) {
                Ok(()) => lease.mounted = None,
                Err(e) => failures.push(e),
            }
        }

        if let Some(clone) = lease.clone.clone() {
            match self.tool.destroy_clone(&clone) {
                Ok(()) => lease.clone = None,
                Err(e) => failures.push(e),
            }
        }

        if let Some(snapshot) = lease.snapshot.clone() {
            match self.tool.destroy_snapshot(&snapshot) {
                Ok(()) => lease.snapshot = None,
                Err(e) => failures.push(e),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReleaseError { failures })
        }
    }

    /// Release a lease. Idempotent; safe after a partial earlier release.
    pub fn release(&self, id: &str) -> std::result::Result<(), ReleaseError> {
        let Some(mut lease) = self.registry().get(id).cloned() else {
            return Ok(());
        };
        if lease.state == LeaseState::Released {
            debug!(lease = %id, "Lease already released");
            return Ok(());
        }

        let result = self.teardown(&mut lease);
        if result.is_ok() && lease.state != LeaseState::Failed {
            lease.state = LeaseState::Released;
        } else if lease.mounted.is_none() && lease.state == LeaseState::Mounted {
            lease.state = LeaseState::Created;
        }
        self.store(&lease);

        match &result {
            Ok(()) => info!(lease = %id, mount = %lease.mount_path.display(), "Snapshot lease released"),
            Err(e) => warn!(lease = %id, error = %e, "Snapshot lease release incomplete"),
        }
        result
    }

    /// Snapshot of every lease record known to this manager.
    pub fn leases(&self) -> Vec<SnapshotLease> {
        self.registry().values().cloned().collect()
    }

    /// Leases currently mounted at `mount`.
    pub fn mounted_at(&self, mount: &Path) -> Vec<SnapshotLease> {
        self.registry()
            .values()
            .filter(|l| l.state == LeaseState::Mounted && l.mount_path == mount)
            .cloned()
            .collect()
    }
}

/// Scoped ownership of a mounted lease.
///
/// Call [`LeaseGuard::release`] on every normal path; if the guard is
/// dropped unreleased (task abort, panic) the release runs from `Drop`.
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    lease: SnapshotLease,
    released: bool,
}

/// Hand-off between a blocking acquisition and the task waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Pending,
    Delivered,
    Abandoned,
}

impl LeaseGuard {
    /// Acquire a lease on a blocking thread, waiting at most `limit`.
    ///
    /// Returns `Ok(None)` when the tool did not finish in time. The
    /// acquisition keeps running on its thread and releases the lease
    /// itself as soon as it completes, so nothing is left mounted.
    pub async fn acquire(
        manager: Arc<LeaseManager>,
        source: PathBuf,
        mount: PathBuf,
        limit: Duration,
    ) -> Result<Option<Self>> {
        let handoff = Arc::new(Mutex::new(Handoff::Pending));
        let worker = Arc::clone(&manager);
        let slot = Arc::clone(&handoff);
        let mut task = tokio::task::spawn_blocking(move || {
            let lease = worker.acquire(&source, &mount)?;
            let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
            if *state == Handoff::Abandoned {
                drop(state);
                warn!(lease = %lease.id, "Lease acquired after its caller gave up, releasing");
                if let Err(e) = worker.release(&lease.id) {
                    warn!(lease = %lease.id, error = %e, "Release of abandoned lease incomplete");
                }
                return Err(EngineError::Task("lease acquisition abandoned".into()));
            }
            *state = Handoff::Delivered;
            Ok(lease)
        });

        let waited = tokio::time::timeout(limit, &mut task).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) => {
                let delivered = {
                    let mut state = handoff.lock().unwrap_or_else(|e| e.into_inner());
                    if *state != Handoff::Delivered {
                        *state = Handoff::Abandoned;
                    }
                    *state == Handoff::Delivered
                };
                if !delivered {
                    debug!(?limit, "Lease acquisition abandoned");
                    return Ok(None);
                }
                // Finished between the deadline and the lock; the result is ready.
                task.await
            }
        };
        let lease = joined.map_err(|e| EngineError::Task(format!("lease acquisition task: {}", e)))??;

        Ok(Some(Self {
            manager,
            lease,
            released: false,
        }))
    }

    pub fn lease(&self) -> &SnapshotLease {
        &self.lease
    }

    pub fn mount_path(&self) -> &Path {
        &self.lease.mount_path
    }

    /// Release on a blocking thread.
    pub async fn release(mut self) -> std::result::Result<(), ReleaseError> {
        self.released = true;
        let manager = Arc::clone(&self.manager);
        let id = self.lease.id.clone();

        tokio::task::spawn_blocking(move || manager.release(&id))
            .await
            .unwrap_or_else(|e| {
                Err(ReleaseError {
                    failures: vec![SnapshotError::new("release-task", e.to_string())],
                })
            })
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(lease = %self.lease.id, "Lease dropped without release, releasing now");
        let manager = Arc::clone(&self.manager);
        let id = self.lease.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let _ = manager.release(&id);
                });
            }
            Err(_) => {
                let _ = manager.release(&id);
            }
        }
    }
}
