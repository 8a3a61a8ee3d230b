//! Storage Layer - durable JSON documents on the local filesystem
//!
//! One logical document per file in the data directory:
//! - `<name>.json`: canonical document, replaced atomically (temp file + fsync + rename)
//! - `<name>.corrupt-<timestamp>.json`: malformed bytes moved aside during recovery
//! - `<name>.json.lock`: advisory cross-process lock
//! - `.<name>.json.<uuid>.tmp`: in-flight write

pub mod document;
pub mod durable;
pub mod error;
pub mod lock;

pub use document::{CURRENT_VERSION, Document, DocumentMeta, DocumentStore};
pub use durable::DurableStore;
pub use error::{StorageError, StorageResult};
pub use lock::{LockGuard, LockInfo};
