//! Backup Engine Library
//!
//! Snapshot-coordinated staged backups and self-healing restore of service
//! data directories.

pub mod config;
pub mod daemon;
pub mod exec;
pub mod executor;
pub mod orchestrator;
pub mod report;
pub mod restore;
pub mod snapshot;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{EngineError, Result};
