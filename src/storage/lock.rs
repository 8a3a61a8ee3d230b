//! Advisory cross-process file locks.
//!
//! A lock on `queue.json` is the sibling file `queue.json.lock`, created with
//! `create_new` so exactly one participant can hold it. The file records the
//! holder's pid and acquisition time. That record decides staleness and
//! ownership: a lock is only reclaimed once its holder is gone, and a guard only
//! removes a lock file that still carries its own record.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::error::{StorageError, StorageResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Held advisory lock. The lock file is removed when the guard is released or dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    info: LockInfo,
    /// Whether `info` made it into the lock file
    recorded: bool,
    released: bool,
}

impl LockGuard {
    /// Path of the lock file itself.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Holder record written into the lock file.
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release the lock, reporting a failure to remove the lock file.
    pub async fn release(mut self) -> StorageResult<()> {
        self.released = true;
        let current = fs::read(&self.lock_path).await.ok();
        if !self.owns(current.as_deref()) {
            return Ok(());
        }
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::write(&self.lock_path, e)),
        }
    }

    /// Whether lock file bytes still belong to this guard.
    fn owns(&self, contents: Option<&[u8]>) -> bool {
        let Some(bytes) = contents else {
            return false;
        };
        match serde_json::from_slice::<LockInfo>(bytes) {
            Ok(info) if info == self.info => true,
            Ok(_) => {
                tracing::warn!(path = %self.lock_path.display(), "Lock file now belongs to another holder; leaving it");
                false
            }
            // Our own record never landed, so the bytes are ours to remove.
            Err(_) => !self.recorded,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Drop cannot await.
        let current = std::fs::read(&self.lock_path).ok();
        if !self.owns(current.as_deref()) {
            return;
        }
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => tracing::debug!(path = %self.lock_path.display(), "Released lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.lock_path.display(), error = %e, "Failed to remove lock file")
            }
        }
    }
}

/// Lock file path for a document path: `<path>.lock`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

/// Acquire the lock for `target`, retrying with exponential backoff until `timeout`.
pub(crate) async fn acquire(
    target: &Path,
    timeout: Duration,
    stale_after: Duration,
) -> StorageResult<LockGuard> {
    let lock_path = lock_path_for(target);
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::write(parent, e))?;
        }
    }

    let started = Instant::now();
    let deadline = started + timeout;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match try_create(&lock_path).await {
            Ok(guard) => {
                tracing::debug!(path = %lock_path.display(), waited = ?started.elapsed(), "Acquired lock");
                return Ok(guard);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(StorageError::write(&lock_path, e)),
        }

        if reclaim_if_stale(&lock_path, stale_after).await {
            continue;
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(StorageError::lock_timeout(target, now - started));
        }
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn try_create(lock_path: &Path) -> std::io::Result<LockGuard> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .await?;
    // Guard exists before the next await so a cancelled acquire still cleans up.
    let mut guard = LockGuard {
        lock_path: lock_path.to_path_buf(),
        info: LockInfo::current(),
        recorded: false,
        released: false,
    };

    let info = serde_json::to_vec(&guard.info).unwrap_or_default();
    let recorded = async {
        file.write_all(&info).await?;
        file.flush().await
    };
    match recorded.await {
        Ok(()) => guard.recorded = true,
        Err(e) => {
            tracing::debug!(path = %lock_path.display(), error = %e, "Failed to record lock holder")
        }
    }
    Ok(guard)
}

/// Read the holder recorded in a lock file, if it parses.
pub async fn read_lock_info(lock_path: &Path) -> Option<LockInfo> {
    let bytes = fs::read(lock_path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Whether a lock has been abandoned.
///
/// A recorded holder decides by liveness alone: a live holder is never stale,
/// however long it keeps the lock. A lock without a readable record (holder
/// crashed before writing it) is stale once older than `stale_after`.
pub async fn is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    if !fs::try_exists(lock_path).await.unwrap_or(false) {
        return false;
    }
    if let Some(info) = read_lock_info(lock_path).await {
        return !process_alive(info.pid);
    }
    file_age(lock_path).await > stale_after
}

/// Remove `lock_path` if it is stale. Returns true if the lock is now free.
///
/// Reclaimers serialize on a `<lock>.reclaim` gate and re-check staleness under
/// it, so a lock created by another waiter after the first check is never removed.
pub async fn reclaim_if_stale(lock_path: &Path, stale_after: Duration) -> bool {
    if !is_stale(lock_path, stale_after).await {
        return false;
    }

    let gate = reclaim_gate_for(lock_path);
    match OpenOptions::new().write(true).create_new(true).open(&gate).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // A reclaimer that crashed mid-reclaim must not wedge the lock.
            if file_age(&gate).await > stale_after {
                let _ = fs::remove_file(&gate).await;
            }
            return false;
        }
        Err(e) => {
            tracing::warn!(path = %gate.display(), error = %e, "Failed to open reclaim gate");
            return false;
        }
    }

    let freed = if is_stale(lock_path, stale_after).await {
        match fs::remove_file(lock_path).await {
            Ok(()) => {
                tracing::warn!(path = %lock_path.display(), "Reclaimed stale lock");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(path = %lock_path.display(), error = %e, "Failed to reclaim stale lock");
                false
            }
        }
    } else {
        false
    };

    if let Err(e) = fs::remove_file(&gate).await {
        tracing::warn!(path = %gate.display(), error = %e, "Failed to remove reclaim gate");
    }
    freed
}

fn reclaim_gate_for(lock_path: &Path) -> PathBuf {
    let mut raw = lock_path.as_os_str().to_owned();
    raw.push(".reclaim");
    PathBuf::from(raw)
}

async fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    // Signal 0 performs the permission and existence checks without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
