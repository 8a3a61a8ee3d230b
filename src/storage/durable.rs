//! Durable JSON document storage.
//!
//! One logical document maps to one file `<data_dir>/<name>.json`. Writes go to
//! a uniquely named temp file in the same directory, are fsync'd, then renamed
//! over the target, so readers only ever see the previous or the new document.
//! A document that no longer parses is moved aside to
//! `<name>.corrupt-<timestamp>.json` and replaced by the caller's default.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::lock::{self, LockGuard};
use crate::config::StoreConfig;

const DOCUMENT_EXTENSION: &str = "json";
const CORRUPT_MARKER: &str = ".corrupt-";

/// Shared engine for reading, writing, recovering and locking documents.
///
/// Construct once at start-up and share it (`Arc<DurableStore>`) with every
/// typed store; it holds no per-document state.
#[derive(Debug, Clone)]
pub struct DurableStore {
    data_dir: PathBuf,
    lock_timeout: Duration,
    lock_stale: Duration,
}

impl DurableStore {
    /// Create a store over the configured data directory.
    ///
    /// The directory is created lazily by the first write.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            lock_timeout: config.lock_timeout(),
            lock_stale: config.lock_stale(),
        }
    }

    /// Create a store over `data_dir` with default lock settings.
    pub fn open(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(&StoreConfig::with_data_dir(data_dir))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Lock timeout used by [`DurableStore::lock`].
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Map a logical document name to its file path.
    ///
    /// `"queue"` and `"queue.json"` both resolve to `<data_dir>/queue.json`.
    /// Names that could escape the data directory or collide with temp files
    /// are rejected.
    pub fn resolve_path(&self, name: &str) -> StorageResult<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed != name
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || name.contains(CORRUPT_MARKER)
        {
            return Err(StorageError::invalid_name(name));
        }

        let file_name = if name.ends_with(".json") {
            name.to_string()
        } else {
            format!("{}.{}", name, DOCUMENT_EXTENSION)
        };
        Ok(self.data_dir.join(file_name))
    }

    /// Read and parse a document.
    ///
    /// Returns `Ok(None)` when the file does not exist, and
    /// `StorageError::Corruption` when it exists but is not well-formed JSON.
    pub async fn read(&self, path: &Path) -> StorageResult<Option<Value>> {
        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::read(path, e)),
        };

        let value = serde_json::from_slice::<Value>(&bytes)
            .map_err(|e| StorageError::corruption(path, e.to_string()))?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Read document");
        Ok(Some(value))
    }

    /// Read a document, recovering from absence and corruption.
    ///
    /// - absent: `default` is returned and nothing is written
    /// - corrupt: the file is renamed to a timestamped backup, `default` is
    ///   written in its place and returned
    ///
    /// Read and write failures of the filesystem itself still propagate.
    pub async fn read_with_recovery(&self, path: &Path, default: Value) -> StorageResult<Value> {
        match self.read(path).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Ok(default),
            Err(StorageError::Corruption { message, .. }) => {
                let backup = self.quarantine(path).await?;
                tracing::warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %message,
                    "Recovered corrupt document; original bytes preserved in backup"
                );
                self.write(path, &default).await?;
                Ok(default)
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the document at `path` with `value`.
    pub async fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> StorageResult<()> {
        let mut bytes =
            serde_json::to_vec_pretty(value).map_err(|e| StorageError::serialization(e.to_string()))?;
        bytes.push(b'\n');

        let dir = parent_dir(path);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::write(&dir, e))?;

        let file_name = path
            .file_name()
            .ok_or_else(|| StorageError::invalid_name(path.display().to_string()))?;
        let temp_path = dir.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));

        if let Err(e) = write_synced(&temp_path, &bytes).await {
            discard(&temp_path).await;
            return Err(StorageError::write(&temp_path, e));
        }

        // Atomic rename
        if let Err(e) = fs::rename(&temp_path, path).await {
            discard(&temp_path).await;
            return Err(StorageError::write(path, e));
        }

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Wrote document");
        Ok(())
    }

    /// Acquire the advisory lock for `path`, waiting at most `timeout`.
    pub async fn acquire_lock(&self, path: &Path, timeout: Duration) -> StorageResult<LockGuard> {
        lock::acquire(path, timeout, self.lock_stale).await
    }

    /// Acquire the advisory lock for `path` with the configured timeout.
    pub async fn lock(&self, path: &Path) -> StorageResult<LockGuard> {
        self.acquire_lock(path, self.lock_timeout).await
    }

    /// Modification time of the document, or `None` if it does not exist.
    pub async fn mtime(&self, path: &Path) -> StorageResult<Option<SystemTime>> {
        match fs::metadata(path).await {
            Ok(m) => Ok(m.modified().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::read(path, e)),
        }
    }

    /// Corrupt backups kept for a document, oldest first.
    pub async fn list_backups(&self, name: &str) -> StorageResult<Vec<PathBuf>> {
        let path = self.resolve_path(name)?;
        let prefix = format!("{}{}", file_stem(&path), CORRUPT_MARKER);

        let mut backups: Vec<PathBuf> = self
            .list_files()
            .await?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Logical names of the documents in the data directory (backups excluded).
    pub async fn list_documents(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self
            .list_files()
            .await?
            .iter()
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.strip_suffix(".json")?;
                // Only names that resolve back to this same file
                (self.resolve_path(name).ok().as_ref() == Some(p)).then(|| name.to_string())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Lock files currently present in the data directory.
    pub async fn list_locks(&self) -> StorageResult<Vec<PathBuf>> {
        let mut locks: Vec<PathBuf> = self
            .list_files()
            .await?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "lock"))
            .collect();
        locks.sort();
        Ok(locks)
    }

    /// Whether a lock file is abandoned under the configured stale age.
    pub async fn is_lock_stale(&self, lock_path: &Path) -> bool {
        lock::is_stale(lock_path, self.lock_stale).await
    }

    /// Remove a lock file if it is stale, serialized against other reclaimers.
    pub async fn reclaim_stale_lock(&self, lock_path: &Path) -> bool {
        lock::reclaim_if_stale(lock_path, self.lock_stale).await
    }

    /// Move the document at `path` aside to a timestamped backup.
    ///
    /// Returns `None` when there is no file to move.
    pub async fn back_up(&self, path: &Path) -> StorageResult<Option<PathBuf>> {
        if !fs::try_exists(path).await.map_err(|e| StorageError::read(path, e))? {
            return Ok(None);
        }
        self.quarantine(path).await.map(Some)
    }

    async fn list_files(&self) -> StorageResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.data_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::read(&self.data_dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::read(&self.data_dir, e))?
        {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Move a corrupt document aside, never overwriting an earlier backup.
    async fn quarantine(&self, path: &Path) -> StorageResult<PathBuf> {
        let backup = backup_path(path).await;
        fs::rename(path, &backup)
            .await
            .map_err(|e| StorageError::write(&backup, e))?;
        Ok(backup)
    }
}

async fn write_synced(temp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    // fsync for durability
    file.sync_all().await
}

async fn discard(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %temp_path.display(), error = %e, "Failed to remove temp file");
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// `<stem>.corrupt-<timestamp>.json`, with a counter if that name is taken.
async fn backup_path(path: &Path) -> PathBuf {
    let dir = parent_dir(path);
    let stem = file_stem(path);
    // ISO8601 with ':' and '.' swapped for '-' so the name is portable
    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string();

    let mut candidate = dir.join(format!("{}{}{}.json", stem, CORRUPT_MARKER, stamp));
    let mut attempt = 1u32;
    while fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = dir.join(format!("{}{}{}-{}.json", stem, CORRUPT_MARKER, stamp, attempt));
        attempt += 1;
    }
    candidate
}
