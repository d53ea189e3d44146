//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with `BACKUP_ENGINE__*` environment
//! variable overrides (an optional `.env` file is read first).

use crate::executor::job::{BackupJob, CommandSpec};
use crate::restore::{command::CommandMethod, RestoreMethod, RestoreTarget};
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,

    #[serde(default)]
    pub restore: Vec<RestoreServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// node-exporter textfile collector directory; export is skipped when unset
    #[serde(default)]
    pub textfile_dir: Option<PathBuf>,

    /// Prometheus push-gateway base URL
    #[serde(default)]
    pub push_gateway: Option<String>,

    /// Value of the `hostname` label (defaults to the system hostname)
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding persisted job status and the run lock
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// A job whose last success is older than this is reported as stale
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Path to the zfs binary
    #[serde(default = "default_zfs_bin")]
    pub zfs_bin: PathBuf,

    /// Prefix for snapshot and clone names created by the engine
    #[serde(default = "default_snapshot_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Stage execution order; when empty, stages run in order of first appearance
    #[serde(default)]
    pub stages: Vec<String>,

    /// Optional deadline for the whole run
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Time between SIGTERM and SIGKILL when terminating a process group
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    #[serde(deserialize_with = "stage_key")]
    pub stage: String,

    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub uses_snapshot: bool,

    /// Live volume path (also the input path when no snapshot is used)
    #[serde(default)]
    pub snapshot_source: Option<PathBuf>,

    #[serde(default)]
    pub snapshot_mount: Option<PathBuf>,

    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreServiceConfig {
    pub service: String,

    pub target: PathBuf,

    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    /// Octal permission bits applied to the target directory before restoring
    #[serde(default = "default_restore_mode")]
    pub mode: String,

    #[serde(default)]
    pub methods: Vec<RestoreMethodConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMethodConfig {
    pub name: String,

    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_restore_timeout_secs")]
    pub timeout_secs: u64,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine")
}

fn default_stale_after_hours() -> u64 {
    26
}

fn default_zfs_bin() -> PathBuf {
    PathBuf::from("zfs")
}

fn default_snapshot_prefix() -> String {
    "backup-engine".to_string()
}

fn default_kill_grace_secs() -> u64 {
    10
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_restore_mode() -> String {
    "0750".to_string()
}

fn default_restore_timeout_secs() -> u64 {
    1800
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            stale_after_hours: default_stale_after_hours(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            zfs_bin: default_zfs_bin(),
            prefix: default_snapshot_prefix(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            deadline_secs: None,
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

/// Stage keys may be written as integers (`stage = 1`) or names.
fn stage_key<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Key {
        Int(i64),
        Name(String),
    }

    Ok(match Key::deserialize(deserializer)? {
        Key::Int(n) => n.to_string(),
        Key::Name(s) => s,
    })
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("BACKUP_ENGINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;

        settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Declared backup jobs, in declaration order
    pub fn backup_jobs(&self) -> Result<Vec<BackupJob>> {
        self.jobs.iter().map(JobConfig::to_job).collect()
    }

    /// Restore definition for one service
    pub fn restore_service(&self, service: &str) -> Option<&RestoreServiceConfig> {
        self.restore.iter().find(|r| r.service == service)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.run.kill_grace_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run.deadline_secs.map(Duration::from_secs)
    }

    /// Value used for the `hostname` metrics label
    pub fn instance_name(&self) -> String {
        self.metrics.instance.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }
}

impl JobConfig {
    pub fn to_job(&self) -> Result<BackupJob> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("job with empty name".into()));
        }
        if self.timeout_secs == 0 {
            return Err(EngineError::Validation(format!(
                "job {}: timeout_secs must be positive",
                self.name
            )));
        }
        if self.uses_snapshot {
            let source_ok = self.snapshot_source.as_ref().is_some_and(|p| !p.as_os_str().is_empty());
            let mount_ok = self.snapshot_mount.as_ref().is_some_and(|p| !p.as_os_str().is_empty());
            if !source_ok || !mount_ok {
                return Err(EngineError::Validation(format!(
                    "job {}: uses_snapshot requires snapshot_source and snapshot_mount",
                    self.name
                )));
            }
        }

        Ok(BackupJob {
            name: self.name.clone(),
            stage: self.stage.clone(),
            command: CommandSpec::new(&self.program, self.args.clone()),
            uses_snapshot: self.uses_snapshot,
            snapshot_source: self.snapshot_source.clone(),
            snapshot_mount: self.snapshot_mount.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            critical: self.critical,
        })
    }
}

impl RestoreServiceConfig {
    /// Target directory description for the resolver. Owner and group
    /// names must exist on this system.
    pub fn to_target(&self) -> Result<RestoreTarget> {
        let mode = u32::from_str_radix(self.mode.trim_start_matches("0o"), 8).map_err(|_| {
            EngineError::Config(format!(
                "restore {}: invalid mode {:?}",
                self.service, self.mode
            ))
        })?;

        let target = RestoreTarget {
            path: self.target.clone(),
            owner: self.owner.clone(),
            group: self.group.clone(),
            mode,
        };
        target.ownership().map_err(|e| match e {
            EngineError::Validation(msg) => EngineError::Validation(format!("restore {}: {}", self.service, msg)),
            other => other,
        })?;
        Ok(target)
    }

    /// Restore methods in declared priority order, each stopped early when
    /// `cancel` fires.
    pub fn to_methods(&self, kill_grace: Duration, cancel: &CancellationToken) -> Vec<Arc<dyn RestoreMethod>> {
        if self.methods.is_empty() {
            tracing::warn!(service = %self.service, "No restore methods configured, target will be initialized empty");
        }

        self.methods
            .iter()
            .map(|m| {
                Arc::new(
                    CommandMethod::new(
                        &m.name,
                        CommandSpec::new(&m.program, m.args.clone()),
                        Duration::from_secs(m.timeout_secs),
                        kill_grace,
                    )
                    .with_cancel(cancel.clone()),
                ) as Arc<dyn RestoreMethod>
            })
            .collect()
    }
}
