//! Content graph document schema.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{Document, DocumentMeta};

/// Threshold used when neither the document nor the config supplies one.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;

fn default_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

/// A piece of content that has been posted.
///
/// Nodes are never edited in place; they are added and removed whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: Uuid,
    /// SHA-256 of the normalized content
    pub content_hash: String,
    /// Raw text, absent when the store is configured not to retain it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub semantic_vector: Vec<f32>,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub posted_at: DateTime<Utc>,
}

impl ContentNode {
    /// Whether the node is tagged with `topic` (case-insensitive).
    pub fn has_topic(&self, topic: &str) -> bool {
        let topic = topic.trim();
        self.topics.iter().any(|t| t.eq_ignore_ascii_case(topic))
    }
}

/// The `content-graph` document: every posted node plus the dedup threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentGraphDocument {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default)]
    pub nodes: Vec<ContentNode>,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
}

impl ContentGraphDocument {
    pub fn with_threshold(similarity_threshold: f32) -> Self {
        Self {
            meta: DocumentMeta::default(),
            nodes: Vec::new(),
            similarity_threshold,
        }
    }
}

impl Default for ContentGraphDocument {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

/// Whether `threshold` is usable as a similarity cut-off.
pub fn is_valid_threshold(threshold: f32) -> bool {
    threshold.is_finite() && (0.0..=1.0).contains(&threshold)
}

impl Document for ContentGraphDocument {
    const NAME: &'static str = "content-graph";

    fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DocumentMeta {
        &mut self.meta
    }

    fn validate(&self) -> Result<(), String> {
        if !is_valid_threshold(self.similarity_threshold) {
            return Err(format!(
                "similarity_threshold {} outside 0.0..=1.0",
                self.similarity_threshold
            ));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return Err(format!("duplicate node id {}", node.id));
            }
            if node.content_hash.len() != 64 || !node.content_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(format!("node {} has malformed content_hash", node.id));
            }
        }
        Ok(())
    }
}
