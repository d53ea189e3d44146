//! Grouping of jobs into ordered stages.

use crate::executor::job::BackupJob;
use crate::utils::{EngineError, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Stage {
    pub key: String,
    pub jobs: Vec<BackupJob>,
}

impl Stage {
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name.clone()).collect()
    }
}

/// Validated, ordered stages of a run.
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Group `jobs` by stage. With an explicit `order` every job's stage
    /// must be listed there; without one, stages run in order of first
    /// appearance. Stages without jobs are dropped.
    pub fn build(jobs: Vec<BackupJob>, order: &[String]) -> Result<Self> {
        let mut names = HashSet::new();
        for job in &jobs {
            if !names.insert(job.name.as_str()) {
                return Err(EngineError::Validation(format!("duplicate job name {}", job.name)));
            }
        }

        let mut keys: Vec<String> = Vec::new();
        if order.is_empty() {
            for job in &jobs {
                if !keys.contains(&job.stage) {
                    keys.push(job.stage.clone());
                }
            }
        } else {
            for key in order {
                if keys.contains(key) {
                    return Err(EngineError::Validation(format!("stage {} listed twice", key)));
                }
                keys.push(key.clone());
            }
            if let Some(job) = jobs.iter().find(|j| !keys.contains(&j.stage)) {
                return Err(EngineError::Validation(format!(
                    "job {}: stage {} is not in the stage order",
                    job.name, job.stage
                )));
            }
        }

        let mut grouped: HashMap<String, Vec<BackupJob>> = HashMap::new();
        for job in jobs {
            grouped.entry(job.stage.clone()).or_default().push(job);
        }

        let mut stages = Vec::new();
        for key in keys {
            let Some(jobs) = grouped.remove(&key) else {
                continue;
            };
            check_mounts(&key, &jobs)?;
            stages.push(Stage { key, jobs });
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }
}

/// Jobs of one stage run concurrently, so no two may share a mount path.
fn check_mounts(stage: &str, jobs: &[BackupJob]) -> Result<()> {
    let mut seen: HashMap<&Path, &str> = HashMap::new();
    for job in jobs.iter().filter(|j| j.uses_snapshot) {
        let Some(mount) = job.snapshot_mount.as_deref() else {
            continue;
        };
        if let Some(other) = seen.insert(mount, &job.name) {
            return Err(EngineError::Validation(format!(
                "stage {}: jobs {} and {} share snapshot mount {}",
                stage,
                other,
                job.name,
                mount.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::job::CommandSpec;
    use std::time::Duration;

    fn job(name: &str, stage: &str) -> BackupJob {
        BackupJob::new(name, stage, CommandSpec::shell("true"), Duration::from_secs(5))
    }

    fn keys(plan: &StagePlan) -> Vec<&str> {
        plan.stages().iter().map(|s| s.key.as_str()).collect()
    }

    #[test]
    fn test_first_appearance_order() {
        let plan = StagePlan::build(
            vec![job("snap", "snapshot"), job("a", "replicate"), job("b", "snapshot")],
            &[],
        )
        .unwrap();

        assert_eq!(keys(&plan), vec!["snapshot", "replicate"]);
        assert_eq!(plan.stages()[0].job_names(), vec!["snap", "b"]);
        assert_eq!(plan.job_count(), 3);
    }

    #[test]
    fn test_explicit_order() {
        let order = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let plan = StagePlan::build(vec![job("archive", "3"), job("snap", "1")], &order).unwrap();
        assert_eq!(keys(&plan), vec!["1", "3"]);
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let order = vec!["1".to_string()];
        let err = StagePlan::build(vec![job("snap", "1"), job("x", "9")], &order).unwrap_err();
        assert!(err.to_string().contains("stage 9"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = StagePlan::build(vec![job("a", "1"), job("a", "2")], &[]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_shared_mount_within_stage_rejected() {
        let a = job("a", "2").with_snapshot("/srv/a", "/mnt/backup");
        let b = job("b", "2").with_snapshot("/srv/b", "/mnt/backup");
        assert!(StagePlan::build(vec![a.clone(), b.clone()], &[]).is_err());

        // Different stages never run at the same time.
        let b = job("b", "3").with_snapshot("/srv/b", "/mnt/backup");
        assert!(StagePlan::build(vec![a, b], &[]).is_ok());
    }
}
