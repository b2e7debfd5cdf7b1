//! Exclusive per-data-directory lock held for the duration of a command.
//!
//! The lock is a file next to the data directory created with `O_EXCL`. It
//! records the holder's pid so that a lock left behind by a killed process
//! can be reclaimed.

use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub operation: String,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn is_stale(&self) -> bool {
        let Ok(raw) = i32::try_from(self.pid) else {
            return true;
        };
        matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
    }
}

#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
}

impl DataDirLock {
    /// `<parent>/.<name>.dr.lock`, kept outside the data directory so restores
    /// can move the directory freely.
    pub fn lock_path(data_dir: &Path) -> Result<PathBuf> {
        let name = data_dir.file_name().ok_or_else(|| {
            DrError::Prerequisite(format!("{} has no directory name", data_dir.display()))
        })?;
        Ok(data_dir.with_file_name(format!(".{}.dr.lock", name.to_string_lossy())))
    }

    pub fn acquire(data_dir: &Path, operation: &str) -> Result<Self> {
        let path = Self::lock_path(data_dir)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            operation: operation.to_string(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default(),
            acquired_at: Utc::now(),
        };

        // One retry after reclaiming a stale lock
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = DataDirLock { path };
                    file.write_all(&serde_json::to_vec(&info)?)?;
                    file.sync_all()?;
                    debug!("Acquired {} for {}", lock.path.display(), operation);
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = Self::holder(&path);
                    match holder {
                        Some(h) if h.is_stale() => {
                            warn!(
                                "Reclaiming stale lock {} from pid {} ({})",
                                path.display(),
                                h.pid,
                                h.operation
                            );
                            fs::remove_file(&path)?;
                        }
                        Some(h) => {
                            return Err(DrError::Locked(format!(
                                "{} is running as pid {} on {} since {}",
                                h.operation, h.pid, h.host, h.acquired_at
                            )));
                        }
                        None => {
                            return Err(DrError::Locked(format!(
                                "unreadable lock file {}; remove it if no operation is running",
                                path.display()
                            )));
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DrError::Locked(format!(
            "could not acquire {}",
            path.display()
        )))
    }

    /// Current holder recorded in the lock file, if readable
    pub fn holder(path: &Path) -> Option<LockInfo> {
        let content = fs::read(path).ok()?;
        serde_json::from_slice(&content).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
