//! Typed document stores.
//!
//! Each domain store (queue, drafts, analytics, network, learning, content
//! graph) owns exactly one JSON document. It implements [`Document`] for its
//! schema and wraps a [`DocumentStore`], which supplies the shared lifecycle:
//!
//! load-if-needed -> mutate a copy -> stamp `updated_at` -> atomic write -> refresh cache
//!
//! The cycle runs under one async mutex per store, so in-process callers never
//! lose each other's updates. Cross-process callers must use
//! [`DocumentStore::update_locked`]; without it the last writer wins.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::durable::DurableStore;
use super::error::{StorageError, StorageResult};

/// Schema version written into new documents. Not interpreted yet.
pub const CURRENT_VERSION: u32 = 1;

fn current_version() -> u32 {
    CURRENT_VERSION
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Fields every document carries, flattened into the document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            updated_at: Utc::now(),
        }
    }
}

/// A JSON document owned by one logical store.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical name; the file is `<data_dir>/<NAME>.json`.
    const NAME: &'static str;

    fn meta(&self) -> &DocumentMeta;

    fn meta_mut(&mut self) -> &mut DocumentMeta;

    /// Schema checks serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// In-memory lifecycle of one document.
#[derive(Debug)]
struct StoreHandle<D> {
    cached: Option<D>,
    last_known_good_mtime: Option<SystemTime>,
    /// The file holds a schema-invalid document that the cache replaced.
    invalid_on_disk: bool,
}

/// Cached, serialized access to one typed document.
pub struct DocumentStore<D: Document> {
    durable: Arc<DurableStore>,
    file_path: PathBuf,
    default: D,
    handle: Mutex<StoreHandle<D>>,
}

impl<D: Document + Default> DocumentStore<D> {
    /// Open the store for `D`, using `D::default()` when the document is absent or invalid.
    pub fn new(durable: Arc<DurableStore>) -> StorageResult<Self> {
        Self::with_default(durable, D::default())
    }
}

impl<D: Document> DocumentStore<D> {
    /// Open the store for `D` with an explicit default document.
    pub fn with_default(durable: Arc<DurableStore>, default: D) -> StorageResult<Self> {
        let file_path = durable.resolve_path(D::NAME)?;
        Ok(Self {
            durable,
            file_path,
            default,
            handle: Mutex::new(StoreHandle {
                cached: None,
                last_known_good_mtime: None,
                invalid_on_disk: false,
            }),
        })
    }

    /// File backing this document.
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Shared durable engine.
    pub fn durable(&self) -> &Arc<DurableStore> {
        &self.durable
    }

    /// Current document (cached after the first read).
    pub async fn load(&self) -> StorageResult<D> {
        let mut handle = self.handle.lock().await;
        Ok(self.ensure_loaded(&mut handle).await?.clone())
    }

    /// Borrow the current document without cloning it.
    pub async fn read<R>(&self, f: impl FnOnce(&D) -> R) -> StorageResult<R> {
        let mut handle = self.handle.lock().await;
        let doc = self.ensure_loaded(&mut handle).await?;
        Ok(f(doc))
    }

    /// Apply `f` to a copy of the document and persist the result.
    pub async fn update<R>(&self, f: impl FnOnce(&mut D) -> R) -> StorageResult<R> {
        self.try_update(|doc| Ok::<_, StorageError>(f(doc))).await
    }

    /// Like [`update`](Self::update), but `f` may refuse; nothing is written on `Err`.
    pub async fn try_update<R, E>(&self, f: impl FnOnce(&mut D) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let mut handle = self.handle.lock().await;
        self.apply(&mut handle, f).await
    }

    /// Update under the cross-process lock, rereading the file first so a write
    /// by another process is never overwritten.
    pub async fn update_locked<R>(&self, f: impl FnOnce(&mut D) -> R) -> StorageResult<R> {
        self.try_update_locked(|doc| Ok::<_, StorageError>(f(doc))).await
    }

    /// Fallible variant of [`update_locked`](Self::update_locked).
    pub async fn try_update_locked<R, E>(
        &self,
        f: impl FnOnce(&mut D) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let mut handle = self.handle.lock().await;
        let guard = self.durable.lock(&self.file_path).await?;

        // mtime resolution can hide another process's write; always reread under the lock.
        if self.changed_on_disk(&handle).await? {
            tracing::debug!(document = D::NAME, "Document changed on disk; reloading");
        }
        handle.cached = None;

        // An early return drops the guard, which removes the lock file.
        let out = self.apply(&mut handle, f).await?;
        guard.release().await?;
        Ok(out)
    }

    /// Persist `doc` as the whole document.
    pub async fn save(&self, mut doc: D) -> StorageResult<()> {
        doc.validate()
            .map_err(|reason| StorageError::invalid_document(D::NAME, reason))?;
        let mut handle = self.handle.lock().await;
        // Loading first notices a schema-invalid file, which persist then backs up.
        self.ensure_loaded(&mut handle).await?;
        doc.meta_mut().updated_at = Utc::now();
        self.persist(&mut handle, doc).await
    }

    /// Whether the file changed since this handle last read or wrote it.
    pub async fn is_stale(&self) -> StorageResult<bool> {
        let handle = self.handle.lock().await;
        self.changed_on_disk(&handle).await
    }

    /// Drop the cached document so the next access rereads the file.
    ///
    /// Intended for test harnesses; runtime code never needs it.
    pub async fn reset(&self) {
        let mut handle = self.handle.lock().await;
        handle.cached = None;
        handle.last_known_good_mtime = None;
        handle.invalid_on_disk = false;
    }

    async fn apply<R, E>(
        &self,
        handle: &mut StoreHandle<D>,
        f: impl FnOnce(&mut D) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let mut next = self.ensure_loaded(handle).await?.clone();
        let out = f(&mut next)?;

        next.validate()
            .map_err(|reason| StorageError::invalid_document(D::NAME, reason))?;
        next.meta_mut().updated_at = Utc::now();
        self.persist(handle, next).await?;
        Ok(out)
    }

    /// Write, then replace the cache. A failed write leaves the cache untouched.
    ///
    /// A schema-invalid file is moved aside before the first write replaces it.
    async fn persist(&self, handle: &mut StoreHandle<D>, doc: D) -> StorageResult<()> {
        if handle.invalid_on_disk {
            if let Some(backup) = self.durable.back_up(&self.file_path).await? {
                tracing::warn!(document = D::NAME, backup = %backup.display(), "Backed up schema-invalid document before overwriting");
            }
            handle.invalid_on_disk = false;
        }
        self.durable.write(&self.file_path, &doc).await?;
        handle.last_known_good_mtime = self.durable.mtime(&self.file_path).await.ok().flatten();
        handle.cached = Some(doc);
        Ok(())
    }

    async fn ensure_loaded<'a>(&self, handle: &'a mut StoreHandle<D>) -> StorageResult<&'a D> {
        let doc = match handle.cached.take() {
            Some(doc) => doc,
            None => {
                let (doc, invalid) = self.load_from_disk().await?;
                handle.last_known_good_mtime = self.durable.mtime(&self.file_path).await?;
                handle.invalid_on_disk = invalid;
                doc
            }
        };
        Ok(handle.cached.insert(doc))
    }

    /// Returns the document and whether the file was schema-invalid.
    async fn load_from_disk(&self) -> StorageResult<(D, bool)> {
        let path = &self.file_path;
        let default_value = serde_json::to_value(&self.default)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        let value = self.durable.read_with_recovery(path, default_value).await?;

        // Parseable but schema-invalid documents are treated as absent until the next write.
        match serde_json::from_value::<D>(value) {
            Ok(doc) => match doc.validate() {
                Ok(()) => Ok((doc, false)),
                Err(reason) => {
                    tracing::warn!(document = D::NAME, path = %path.display(), %reason, "Document failed validation; using default");
                    Ok((self.default.clone(), true))
                }
            },
            Err(e) => {
                tracing::warn!(document = D::NAME, path = %path.display(), error = %e, "Document does not match schema; using default");
                Ok((self.default.clone(), true))
            }
        }
    }

    async fn changed_on_disk(&self, handle: &StoreHandle<D>) -> StorageResult<bool> {
        if handle.cached.is_none() {
            return Ok(false);
        }
        let current = self.durable.mtime(&self.file_path).await?;
        Ok(current != handle.last_known_good_mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct QueueItem {
        id: String,
        text: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct QueueDocument {
        #[serde(flatten)]
        meta: DocumentMeta,
        #[serde(default)]
        items: Vec<QueueItem>,
    }

    impl Document for QueueDocument {
        const NAME: &'static str = "queue";

        fn meta(&self) -> &DocumentMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut DocumentMeta {
            &mut self.meta
        }

        fn validate(&self) -> Result<(), String> {
            let mut seen = HashSet::new();
            for item in &self.items {
                if !seen.insert(&item.id) {
                    return Err(format!("duplicate item id {}", item.id));
                }
            }
            Ok(())
        }
    }

    fn item(id: &str) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            text: format!("post {}", id),
        }
    }

    fn create_store(temp_dir: &TempDir) -> DocumentStore<QueueDocument> {
        let durable = Arc::new(DurableStore::open(temp_dir.path()));
        DocumentStore::new(durable).unwrap()
    }

    #[tokio::test]
    async fn test_load_absent_returns_default_without_writing() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        let doc = store.load().await.unwrap();
        assert!(doc.items.is_empty());
        assert_eq!(doc.meta().version, CURRENT_VERSION);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_update_persists_and_stamps() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        let before = store.load().await.unwrap().meta.updated_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let len = store
            .update(|doc| {
                doc.items.push(item("a"));
                doc.items.len()
            })
            .await
            .unwrap();
        assert_eq!(len, 1);

        let cached = store.load().await.unwrap();
        assert!(cached.meta.updated_at > before);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let on_disk: QueueDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, cached);
    }

    #[tokio::test]
    async fn test_schema_invalid_document_treated_as_absent() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        let path = store.path();
        let invalid = r#"{"version": 1, "updated_at": "2026-01-01T00:00:00Z", "items": "nope"}"#;
        std::fs::write(&path, invalid).unwrap();

        let doc = store.load().await.unwrap();
        assert!(doc.items.is_empty());

        // Parseable JSON is not quarantined on read
        assert!(store.durable().list_backups("queue").await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), invalid);
    }

    #[tokio::test]
    async fn test_schema_invalid_document_backed_up_before_first_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        let invalid = r#"{"version": 1, "updated_at": "2026-01-01T00:00:00Z", "items": "nope"}"#;
        std::fs::write(store.path(), invalid).unwrap();

        assert!(store.load().await.unwrap().items.is_empty());
        store.update(|doc| doc.items.push(item("a"))).await.unwrap();

        let backups = store.durable().list_backups("queue").await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read_to_string(&backups[0]).unwrap(), invalid);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let on_disk: QueueDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.items, vec![item("a")]);

        // Only the first overwrite needs a backup
        store.update(|doc| doc.items.push(item("b"))).await.unwrap();
        assert_eq!(store.durable().list_backups("queue").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_backs_up_schema_invalid_document() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        let dupes = serde_json::json!({
            "items": [{"id": "a", "text": "x"}, {"id": "a", "text": "y"}]
        })
        .to_string();
        std::fs::write(store.path(), &dupes).unwrap();

        let mut doc = QueueDocument::default();
        doc.items.push(item("z"));
        store.save(doc).await.unwrap();

        let backups = store.durable().list_backups("queue").await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read_to_string(&backups[0]).unwrap(), dupes);
    }

    #[tokio::test]
    async fn test_path_does_not_wait_for_writers() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        let _busy = store.handle.lock().await;
        assert_eq!(store.path(), temp_dir.path().join("queue.json"));
    }

    #[tokio::test]
    async fn test_validation_failure_on_load_uses_default() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        let dupes = serde_json::json!({
            "version": 1,
            "updated_at": "2026-01-01T00:00:00Z",
            "items": [{"id": "a", "text": "x"}, {"id": "a", "text": "y"}]
        });
        std::fs::write(store.path(), dupes.to_string()).unwrap();

        assert!(store.load().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_recovered() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        std::fs::write(store.path(), b"{{{{").unwrap();

        let doc = store.load().await.unwrap();
        assert!(doc.items.is_empty());
        assert_eq!(store.durable().list_backups("queue").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_mutation_is_not_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        store.update(|doc| doc.items.push(item("a"))).await.unwrap();

        let err = store.update(|doc| doc.items.push(item("a"))).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidDocument { .. }));
        assert_eq!(store.load().await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_try_update_error_skips_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        let result: Result<(), crate::Error> = store
            .try_update(|doc| {
                doc.items.push(item("a"));
                Err(crate::Error::NodeNotFound("a".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!store.path().exists());
        assert!(store.load().await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let store: DocumentStore<QueueDocument> =
            DocumentStore::new(Arc::new(DurableStore::open(&data_dir))).unwrap();
        store.update(|doc| doc.items.push(item("a"))).await.unwrap();

        // Make the data directory unusable
        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, b"file in the way").unwrap();

        let err = store.update(|doc| doc.items.push(item("b"))).await.unwrap_err();
        assert!(matches!(err, StorageError::Write { .. }));

        let cached = store.load().await.unwrap();
        assert_eq!(cached.items, vec![item("a")]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(create_store(&temp_dir));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(|doc| doc.items.push(item(&i.to_string())))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.load().await.unwrap().items.len(), 20);
        store.reset().await;
        assert_eq!(store.load().await.unwrap().items.len(), 20);
    }

    #[tokio::test]
    async fn test_update_locked_sees_other_writer() {
        let temp_dir = TempDir::new().unwrap();
        let ours = create_store(&temp_dir);
        let theirs = create_store(&temp_dir);

        ours.update(|doc| doc.items.push(item("a"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        theirs.update(|doc| doc.items.push(item("b"))).await.unwrap();

        assert!(ours.is_stale().await.unwrap());
        ours.update_locked(|doc| doc.items.push(item("c"))).await.unwrap();

        let ids: Vec<String> = ours.load().await.unwrap().items.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!ours.is_stale().await.unwrap());

        // Lock released after the update
        let path = ours.path();
        assert!(!super::super::lock::lock_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_update_locked_times_out_when_held() {
        let temp_dir = TempDir::new().unwrap();
        let config = crate::StoreConfig {
            lock_timeout_ms: 40,
            ..crate::StoreConfig::with_data_dir(temp_dir.path())
        };
        let store: DocumentStore<QueueDocument> =
            DocumentStore::new(Arc::new(DurableStore::new(&config))).unwrap();

        let path = store.path();
        let _held = store.durable().lock(&path).await.unwrap();

        let err = store.update_locked(|doc| doc.items.push(item("a"))).await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_save_and_reset() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);
        let other = create_store(&temp_dir);

        let mut doc = QueueDocument::default();
        doc.items.push(item("x"));
        other.save(doc).await.unwrap();

        // Cache populated before the external write stays until reset
        assert!(store.load().await.unwrap().items.len() == 1);
        other.update(|doc| doc.items.clear()).await.unwrap();
        assert_eq!(store.load().await.unwrap().items.len(), 1);

        store.reset().await;
        assert!(store.load().await.unwrap().items.is_empty());
    }
}
