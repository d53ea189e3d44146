//! Restore target directory handling.

use crate::utils::{EngineError, Result};
use nix::unistd::{chown, Gid, Group, Uid, User};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Data directory of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    pub path: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Permission bits applied when the directory is prepared
    pub mode: u32,
}

/// Files and bytes found under a restored target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentStats {
    pub files: u64,
    pub bytes: u64,
}

impl RestoreTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
            group: None,
            mode: 0o750,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the directory holds at least one entry.
    pub fn is_populated(&self) -> io::Result<bool> {
        match fs::read_dir(&self.path) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove whatever a failed attempt left behind, keeping the directory.
    pub fn clear(&self) -> io::Result<()> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn content_stats(&self) -> ContentStats {
        WalkDir::new(&self.path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .fold(ContentStats::default(), |mut stats, entry| {
                stats.files += 1;
                stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                stats
            })
    }

    /// Resolve the configured owner and group names.
    ///
    /// Fails with [`EngineError::Validation`] for a name the system does
    /// not know.
    pub fn ownership(&self) -> Result<(Option<Uid>, Option<Gid>)> {
        let uid = self.owner.as_deref().map(lookup_user).transpose()?;
        let gid = self.group.as_deref().map(lookup_group).transpose()?;
        Ok((uid, gid))
    }

    /// Create the directory if missing and apply the configured ownership
    /// and mode. Existing content is left alone.
    pub fn initialize_empty(&self) -> Result<()> {
        let (uid, gid) = self.ownership()?;
        fs::create_dir_all(&self.path)?;

        if uid.is_some() || gid.is_some() {
            chown(&self.path, uid, gid).map_err(|e| {
                EngineError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("chown {}: {}", self.path.display(), e),
                ))
            })?;
        }

        fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode))?;
        Ok(())
    }
}

fn lookup_user(name: &str) -> Result<Uid> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(EngineError::Validation(format!("unknown user {}", name))),
        Err(e) => Err(EngineError::Validation(format!("user lookup {}: {}", name, e))),
    }
}

fn lookup_group(name: &str) -> Result<Gid> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(EngineError::Validation(format!("unknown group {}", name))),
        Err(e) => Err(EngineError::Validation(format!("group lookup {}: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_populated_detection() {
        let dir = TempDir::new().unwrap();
        let target = RestoreTarget::new(dir.path().join("data"));
        assert!(!target.is_populated().unwrap());

        fs::create_dir(target.path()).unwrap();
        assert!(!target.is_populated().unwrap());

        fs::write(target.path().join(".keep"), b"").unwrap();
        assert!(target.is_populated().unwrap());
    }

    #[test]
    fn test_clear_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let target = RestoreTarget::new(dir.path());
        fs::create_dir_all(dir.path().join("db/wal")).unwrap();
        fs::write(dir.path().join("db/wal/0001"), b"partial").unwrap();
        fs::write(dir.path().join("config.xml"), b"<x/>").unwrap();

        target.clear().unwrap();
        assert!(dir.path().is_dir());
        assert!(!target.is_populated().unwrap());

        RestoreTarget::new(dir.path().join("missing")).clear().unwrap();
    }

    #[test]
    fn test_content_stats() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("sub/b"), vec![0u8; 24]).unwrap();

        let stats = RestoreTarget::new(dir.path()).content_stats();
        assert_eq!(stats, ContentStats { files: 2, bytes: 124 });
    }

    #[test]
    fn test_initialize_empty_sets_mode_and_owner() {
        let dir = TempDir::new().unwrap();
        let me = User::from_uid(Uid::current()).unwrap().unwrap();

        let mut target = RestoreTarget::new(dir.path().join("var/lib/sonarr"));
        target.owner = Some(me.name.clone());
        target.mode = 0o700;
        target.initialize_empty().unwrap();

        let meta = fs::metadata(target.path()).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode() & 0o777, 0o700);
        assert_eq!(meta.uid(), me.uid.as_raw());
        assert!(!target.is_populated().unwrap());
    }

    #[test]
    fn test_unknown_owner_rejected() {
        let dir = TempDir::new().unwrap();
        let mut target = RestoreTarget::new(dir.path().join("svc"));
        target.owner = Some("no-such-user-backup-engine".into());
        assert!(matches!(target.ownership(), Err(EngineError::Validation(_))));
        assert!(matches!(target.initialize_empty(), Err(EngineError::Validation(_))));
        // Rejected before anything is created
        assert!(!target.path().exists());

        target.owner = None;
        target.group = Some("no-such-group-backup-engine".into());
        assert!(matches!(target.ownership(), Err(EngineError::Validation(_))));
    }
}
