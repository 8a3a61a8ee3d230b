//! # Postvault - Durable Document Store for Social Automation Agents
//!
//! Every feature of the agent (posting queue, drafts, analytics, network graph,
//! learned patterns, content dedup) keeps its state in one JSON document on disk.
//!
//! Postvault provides:
//! - Atomic, fsync'd document writes (temp file + rename)
//! - Corruption-safe reads that back up and replace malformed documents
//! - Advisory cross-process file locks with acquisition timeouts
//! - A typed document store pattern with a serialized read-modify-write cycle
//! - A content graph with exact-hash and vector-similarity duplicate detection

pub mod config;
pub mod content;
pub mod storage;

// Re-exports for convenient access
pub use config::StoreConfig;
pub use content::{ContentGraph, ContentNode, DuplicateCheck, DuplicateReason};
pub use storage::{Document, DocumentMeta, DocumentStore, DurableStore, LockGuard, StorageError};

/// Result type alias for Postvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Postvault operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Invalid similarity threshold: {0} (expected a value in 0.0..=1.0)")]
    InvalidThreshold(f32),

    #[error("Content node not found: {0}")]
    NodeNotFound(String),
}
