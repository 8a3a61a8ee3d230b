//! Error types for durable document storage.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The file exists but is not well-formed JSON.
    ///
    /// Recovered automatically by `read_with_recovery`; only `read` returns it.
    #[error("corrupt document at {path}: {message}")]
    Corruption { path: PathBuf, message: String },

    /// The filesystem refused a read (other than "not found").
    #[error("I/O error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem refused a write, fsync, rename or backup.
    #[error("I/O error writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The advisory lock was not obtained within the budget.
    #[error("timed out after {waited:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Error serializing a document.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A mutation produced a document that fails its own schema check.
    #[error("refusing to persist invalid {document} document: {reason}")]
    InvalidDocument {
        document: &'static str,
        reason: String,
    },

    /// Logical document name that cannot be mapped to a file in the data directory.
    #[error("invalid document name: {0:?}")]
    InvalidName(String),
}

impl StorageError {
    /// Create a corruption error with path context.
    pub fn corruption(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a read error with path context.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Create a write error with path context.
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Create a lock timeout error.
    pub fn lock_timeout(path: impl Into<PathBuf>, waited: Duration) -> Self {
        Self::LockTimeout {
            path: path.into(),
            waited,
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create an invalid document error.
    pub fn invalid_document(document: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            document,
            reason: reason.into(),
        }
    }

    /// Create an invalid name error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName(name.into())
    }

    /// Whether this error is a recoverable corruption of on-disk bytes.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Convenience type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;
