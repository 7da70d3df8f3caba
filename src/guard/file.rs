// src/guard/file.rs

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use super::{ExecutionGuard, Holder, LockRecord, LockToken};
use crate::errors::Result;

/// Guard backed by an advisory lock on a well-known file per node.
///
/// The lock belongs to the open file description, so it disappears with the
/// process that holds it. Nothing is persisted that would need expiring.
#[derive(Debug, Clone)]
pub struct FileLockGuard {
    lock_dir: PathBuf,
    overrides: HashMap<String, PathBuf>,
}

impl FileLockGuard {
    /// Locks live at `<lock_dir>/<node>.lock` unless overridden.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            overrides: HashMap::new(),
        }
    }

    /// Use an explicit lock file for `node`.
    pub fn with_path(mut self, node: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(node.into(), path.into());
        self
    }

    pub fn lock_path(&self, node: &str) -> PathBuf {
        self.overrides
            .get(node)
            .cloned()
            .unwrap_or_else(|| self.lock_dir.join(format!("{node}.lock")))
    }
}

impl ExecutionGuard for FileLockGuard {
    fn try_acquire(&self, node: &str) -> Result<Option<LockToken>> {
        let path = self.lock_path(node);
        let file = open_lock_file(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                debug!(node, path = %path.display(), "lock held by another execution");
                return Ok(None);
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let held_since = Utc::now();
        stamp_owner(&file, held_since)?;
        debug!(node, path = %path.display(), "acquired node lock");

        Ok(Some(LockToken {
            record: LockRecord {
                node: node.to_string(),
                held_since,
            },
            _holder: Holder::File(file),
        }))
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

/// Record pid and acquisition time for whoever inspects the lock file.
fn stamp_owner(mut file: &File, held_since: chrono::DateTime<Utc>) -> Result<()> {
    file.set_len(0)?;
    writeln!(
        file,
        "{} {}",
        std::process::id(),
        held_since.to_rfc3339()
    )?;
    Ok(())
}
