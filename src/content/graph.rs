//! Content graph engine
//!
//! Decides whether proposed content duplicates something already posted:
//! - exact match: the normalized content hash is already stored (cheap, checked first)
//! - similar content: a stored node's vector is within the similarity threshold

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::hash::content_hash;
use super::node::{ContentGraphDocument, ContentNode, is_valid_threshold};
use super::vector::{LetterFrequencyVectorizer, Vectorizer, cosine_similarity};
use crate::config::StoreConfig;
use crate::storage::{DocumentStore, DurableStore};
use crate::{Error, Result};

/// A stored node together with its similarity to a query vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarNode {
    pub node: ContentNode,
    pub similarity: f32,
}

/// Why content was judged a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    ExactMatch,
    SimilarContent,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::ExactMatch => "exact_match",
            DuplicateReason::SimilarContent => "similar_content",
        }
    }
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of [`ContentGraph::check_duplicate`]
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateCheck {
    Unique,
    ExactMatch { node: ContentNode },
    SimilarContent { node: ContentNode, similarity: f32 },
}

impl DuplicateCheck {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DuplicateCheck::Unique)
    }

    pub fn reason(&self) -> Option<DuplicateReason> {
        match self {
            DuplicateCheck::Unique => None,
            DuplicateCheck::ExactMatch { .. } => Some(DuplicateReason::ExactMatch),
            DuplicateCheck::SimilarContent { .. } => Some(DuplicateReason::SimilarContent),
        }
    }

    pub fn matched_node(&self) -> Option<&ContentNode> {
        match self {
            DuplicateCheck::Unique => None,
            DuplicateCheck::ExactMatch { node } | DuplicateCheck::SimilarContent { node, .. } => {
                Some(node)
            }
        }
    }

    /// Similarity score; only the vector path produces one.
    pub fn similarity(&self) -> Option<f32> {
        match self {
            DuplicateCheck::SimilarContent { similarity, .. } => Some(*similarity),
            _ => None,
        }
    }
}

/// Wire shape: `{ is_duplicate, reason?, matched_node?, similarity? }`
#[derive(Serialize)]
struct DuplicateCheckReport<'a> {
    is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<DuplicateReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_node: Option<&'a ContentNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<f32>,
}

impl Serialize for DuplicateCheck {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        DuplicateCheckReport {
            is_duplicate: self.is_duplicate(),
            reason: self.reason(),
            matched_node: self.matched_node(),
            similarity: self.similarity(),
        }
        .serialize(serializer)
    }
}

/// Summary of the content graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub topics: usize,
    pub similarity_threshold: f32,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl std::fmt::Display for GraphStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Content Graph Statistics:")?;
        writeln!(f, "  Nodes: {}", self.nodes)?;
        writeln!(f, "  Topics: {}", self.topics)?;
        writeln!(f, "  Similarity threshold: {:.2}", self.similarity_threshold)?;
        match (self.oldest, self.newest) {
            (Some(oldest), Some(newest)) => writeln!(f, "  Posted: {} .. {}", oldest, newest),
            _ => writeln!(f, "  Posted: -"),
        }
    }
}

/// Dedup engine over the `content-graph` document
pub struct ContentGraph {
    store: DocumentStore<ContentGraphDocument>,
    vectorizer: Arc<dyn Vectorizer>,
    retain_content: bool,
    locked_writes: bool,
}

impl ContentGraph {
    /// Open the graph with the placeholder letter-frequency vectorizer
    pub fn open(durable: Arc<DurableStore>, config: &StoreConfig) -> Result<Self> {
        Self::with_vectorizer(durable, config, Arc::new(LetterFrequencyVectorizer))
    }

    /// Open the graph with a custom embedding provider
    pub fn with_vectorizer(
        durable: Arc<DurableStore>,
        config: &StoreConfig,
        vectorizer: Arc<dyn Vectorizer>,
    ) -> Result<Self> {
        if !is_valid_threshold(config.similarity_threshold) {
            return Err(Error::InvalidThreshold(config.similarity_threshold));
        }
        let default = ContentGraphDocument::with_threshold(config.similarity_threshold);
        let store = DocumentStore::with_default(durable, default)?;

        Ok(Self {
            store,
            vectorizer,
            retain_content: config.retain_content,
            locked_writes: false,
        })
    }

    /// Route every mutation through the cross-process lock
    pub fn with_locked_writes(mut self, locked: bool) -> Self {
        self.locked_writes = locked;
        self
    }

    /// Underlying typed document store
    pub fn store(&self) -> &DocumentStore<ContentGraphDocument> {
        &self.store
    }

    /// Normalized content hash
    pub fn hash(text: &str) -> String {
        content_hash(text)
    }

    /// Semantic vector from the configured vectorizer
    pub async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        self.vectorizer.vectorize(text).await
    }

    /// All nodes with similarity >= threshold, most similar first.
    ///
    /// `threshold` defaults to the value stored in the document. Equal scores
    /// keep insertion order.
    pub async fn find_similar(&self, vector: &[f32], threshold: Option<f32>) -> Result<Vec<SimilarNode>> {
        let mut results = self
            .store
            .read(|doc| {
                let threshold = threshold.unwrap_or(doc.similarity_threshold);
                doc.nodes
                    .iter()
                    .filter_map(|node| {
                        let similarity = cosine_similarity(vector, &node.semantic_vector);
                        (similarity >= threshold).then(|| SimilarNode {
                            node: node.clone(),
                            similarity,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        // Sort by similarity descending (stable)
        results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    /// Exact hash match first; vector similarity only when that misses.
    pub async fn check_duplicate(&self, text: &str) -> Result<DuplicateCheck> {
        let hash = content_hash(text);
        let exact = self
            .store
            .read(|doc| doc.nodes.iter().find(|n| n.content_hash == hash).cloned())
            .await?;
        if let Some(node) = exact {
            tracing::debug!(node = %node.id, "Exact duplicate");
            return Ok(DuplicateCheck::ExactMatch { node });
        }

        let vector = self.vectorizer.vectorize(text).await?;
        let best = self.find_similar(&vector, None).await?.into_iter().next();

        Ok(match best {
            Some(SimilarNode { node, similarity }) => {
                tracing::debug!(node = %node.id, similarity, "Similar content");
                DuplicateCheck::SimilarContent { node, similarity }
            }
            None => DuplicateCheck::Unique,
        })
    }

    /// Record posted content. Does not check for duplicates.
    pub async fn add_node<I, T>(&self, content: &str, topics: I, vector: Option<Vec<f32>>) -> Result<ContentNode>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.add_node_at(content, topics, vector, Utc::now()).await
    }

    /// Record content posted at a known time (history imports).
    pub async fn add_node_at<I, T>(
        &self,
        content: &str,
        topics: I,
        vector: Option<Vec<f32>>,
        posted_at: DateTime<Utc>,
    ) -> Result<ContentNode>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let semantic_vector = match vector {
            Some(v) => v,
            None => self.vectorizer.vectorize(content).await?,
        };
        if semantic_vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::Embedding("vector contains non-finite values".to_string()));
        }

        let node = ContentNode {
            id: Uuid::new_v4(),
            content_hash: content_hash(content),
            content: self.retain_content.then(|| content.to_string()),
            semantic_vector,
            topics: normalize_topics(topics),
            posted_at,
        };

        let stored = node.clone();
        self.mutate(move |doc| {
            doc.nodes.push(stored);
            Ok(())
        })
        .await?;

        tracing::debug!(node = %node.id, hash = %node.content_hash, "Added content node");
        Ok(node)
    }

    /// Remove a node by ID. Returns false (and writes nothing) if it does not exist.
    pub async fn remove_node(&self, id: Uuid) -> Result<bool> {
        let removed = self
            .mutate(|doc| {
                let before = doc.nodes.len();
                doc.nodes.retain(|n| n.id != id);
                if doc.nodes.len() == before {
                    return Err(Error::NodeNotFound(id.to_string()));
                }
                Ok(())
            })
            .await;

        match removed {
            Ok(()) => Ok(true),
            Err(Error::NodeNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_node(&self, id: Uuid) -> Result<Option<ContentNode>> {
        Ok(self
            .store
            .read(|doc| doc.nodes.iter().find(|n| n.id == id).cloned())
            .await?)
    }

    /// All nodes in insertion order
    pub async fn nodes(&self) -> Result<Vec<ContentNode>> {
        Ok(self.store.read(|doc| doc.nodes.clone()).await?)
    }

    pub async fn nodes_with_topic(&self, topic: &str) -> Result<Vec<ContentNode>> {
        Ok(self
            .store
            .read(|doc| doc.nodes.iter().filter(|n| n.has_topic(topic)).cloned().collect())
            .await?)
    }

    /// Nodes posted within `[start, end]`
    pub async fn posted_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<ContentNode>> {
        Ok(self
            .store
            .read(|doc| {
                doc.nodes
                    .iter()
                    .filter(|n| n.posted_at >= start && n.posted_at <= end)
                    .cloned()
                    .collect()
            })
            .await?)
    }

    pub async fn similarity_threshold(&self) -> Result<f32> {
        Ok(self.store.read(|doc| doc.similarity_threshold).await?)
    }

    /// Persist a new default threshold for similarity checks
    pub async fn set_similarity_threshold(&self, threshold: f32) -> Result<()> {
        if !is_valid_threshold(threshold) {
            return Err(Error::InvalidThreshold(threshold));
        }
        self.mutate(|doc| {
            doc.similarity_threshold = threshold;
            Ok(())
        })
        .await?;
        tracing::info!(threshold, "Updated similarity threshold");
        Ok(())
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        Ok(self
            .store
            .read(|doc| {
                let topics: BTreeSet<String> = doc
                    .nodes
                    .iter()
                    .flat_map(|n| n.topics.iter().map(|t| t.to_lowercase()))
                    .collect();
                GraphStats {
                    nodes: doc.nodes.len(),
                    topics: topics.len(),
                    similarity_threshold: doc.similarity_threshold,
                    oldest: doc.nodes.iter().map(|n| n.posted_at).min(),
                    newest: doc.nodes.iter().map(|n| n.posted_at).max(),
                }
            })
            .await?)
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut ContentGraphDocument) -> Result<R>) -> Result<R> {
        if self.locked_writes {
            self.store.try_update_locked(f).await
        } else {
            self.store.try_update(f).await
        }
    }
}

fn normalize_topics<I, T>(topics: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    topics
        .into_iter()
        .map(|t| t.into().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
