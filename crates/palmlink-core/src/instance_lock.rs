//! Single-instance lock
//!
//! The daemon owns `palmlink.lock` while it runs. The file records the
//! owner's pid and a heartbeat the daemon refreshes periodically. A lock
//! whose heartbeat is older than the staleness window, whose owner process
//! is gone, or which cannot be parsed is treated as abandoned and replaced.

use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Default age after which a heartbeat is considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live daemon holds the lock
    #[error("palmlink is already running (pid {pid})")]
    AlreadyRunning {
        /// Owner process id
        pid: u32,
    },

    /// The lock file now belongs to another process
    #[error("instance lock was taken over by pid {pid}")]
    Lost {
        /// New owner process id
        pid: u32,
    },

    /// Lock file io
    #[error("lock file io: {0}")]
    Io(#[from] io::Error),

    /// Lock state serialization
    #[error("lock file serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLockState {
    /// Owner process id
    pub pid: u32,
    /// When the owner started
    pub started_at: DateTime<Utc>,
    /// Last heartbeat
    pub heartbeat_at: DateTime<Utc>,
}

impl InstanceLockState {
    /// Whether the owner is gone or has stopped refreshing the heartbeat.
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        let heartbeat_old = (now - self.heartbeat_at)
            .to_std()
            .is_ok_and(|age| age > stale_after);
        heartbeat_old || !process_alive(self.pid)
    }
}

/// Held single-instance lock. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    state: InstanceLockState,
    released: bool,
}

impl InstanceLock {
    /// Take the lock at `path`, replacing a stale one.
    pub async fn acquire(path: impl Into<PathBuf>, stale_after: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let now = Utc::now();
        let state = InstanceLockState {
            pid: std::process::id(),
            started_at: now,
            heartbeat_at: now,
        };
        let json = serde_json::to_vec_pretty(&state)?;

        // Second pass only after removing a stale lock.
        for _ in 0..2 {
            match create_exclusive(&path, &json).await {
                Ok(()) => {
                    info!(path = %path.display(), pid = state.pid, "Instance lock acquired");
                    return Ok(Self {
                        path,
                        state,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match Self::read(&path).await {
                Ok(Some(existing)) if !existing.is_stale(stale_after, Utc::now()) => {
                    return Err(LockError::AlreadyRunning { pid: existing.pid });
                }
                Ok(Some(existing)) => {
                    warn!(pid = existing.pid, heartbeat_at = %existing.heartbeat_at, "Replacing stale instance lock");
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Replacing unreadable instance lock");
                }
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Lost a race with another starting daemon.
        match Self::read(&path).await {
            Ok(Some(existing)) => Err(LockError::AlreadyRunning { pid: existing.pid }),
            _ => Err(io::Error::new(io::ErrorKind::AlreadyExists, "instance lock is contended").into()),
        }
    }

    /// Read a lock file without taking it. A missing file is `None`.
    pub async fn read(path: &Path) -> Result<Option<InstanceLockState>> {
        match fsutil::read_optional(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// State written by this process.
    pub fn state(&self) -> &InstanceLockState {
        &self.state
    }

    /// Refresh the heartbeat. Fails with [`LockError::Lost`] if another
    /// process replaced the lock.
    pub async fn heartbeat(&mut self) -> Result<()> {
        if let Ok(Some(current)) = Self::read(&self.path).await {
            if current.pid != self.state.pid {
                return Err(LockError::Lost { pid: current.pid });
            }
        }

        self.state.heartbeat_at = Utc::now();
        let json = serde_json::to_vec_pretty(&self.state)?;
        fsutil::write_private(&self.path, &json).await?;
        debug!(path = %self.path.display(), "Instance lock heartbeat");
        Ok(())
    }

    /// Remove the lock file if this process still owns it.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match Self::read(&self.path).await {
            Ok(Some(current)) if current.pid == self.state.pid => {
                tokio::fs::remove_file(&self.path).await?;
                info!(path = %self.path.display(), "Instance lock released");
            }
            _ => debug!("Instance lock not ours anymore, leaving it"),
        }
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let owned = std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<InstanceLockState>(&bytes).ok())
            .is_some_and(|current| current.pid == self.state.pid);
        if owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn create_exclusive(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests;
