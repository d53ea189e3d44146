//! In-memory snapshot tool for tests.

use super::{SnapshotTool, StepResult};
use crate::utils::SnapshotError;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct FakeSnapshotTool {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    live: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl FakeSnapshotTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(steps: &[&'static str]) -> Self {
        let tool = Self::default();
        for step in steps {
            tool.fail_step(step);
        }
        tool
    }

    /// Every call blocks for `delay`, like a slow external tool.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_step(&self, step: &'static str) {
        self.failing.lock().unwrap().insert(step);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Snapshots, clones and mounts that currently exist.
    pub fn live_objects(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn step(&self, step: &'static str) -> StepResult<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.calls.lock().unwrap().push(step.to_string());
        if self.failing.lock().unwrap().contains(step) {
            Err(SnapshotError::new(step, "injected failure"))
        } else {
            Ok(())
        }
    }
}

impl SnapshotTool for FakeSnapshotTool {
    fn create_snapshot(&self, source: &Path, name: &str) -> StepResult<String> {
        self.step("snapshot-create")?;
        let id = format!("{}@{}", source.display(), name);
        self.live.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    fn create_clone(&self, _snapshot: &str, name: &str) -> StepResult<String> {
        self.step("clone-create")?;
        let id = format!("clone/{}", name);
        self.live.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    fn mount_clone(&self, clone: &str, _mount: &Path) -> StepResult<()> {
        self.step("clone-mount")?;
        self.live.lock().unwrap().insert(format!("mount:{}", clone));
        Ok(())
    }

    fn unmount_clone(&self, clone: &str, _mount: &Path) -> StepResult<()> {
        self.step("unmount")?;
        self.live.lock().unwrap().remove(&format!("mount:{}", clone));
        Ok(())
    }

    fn destroy_clone(&self, clone: &str) -> StepResult<()> {
        self.step("clone-destroy")?;
        self.live.lock().unwrap().remove(clone);
        Ok(())
    }

    fn destroy_snapshot(&self, snapshot: &str) -> StepResult<()> {
        self.step("snapshot-destroy")?;
        self.live.lock().unwrap().remove(snapshot);
        Ok(())
    }
}
