//! Content deduplication
//!
//! Every posted piece of content becomes a [`ContentNode`] in the
//! `content-graph` document. [`ContentGraph`] answers "has this (or something
//! close to it) been posted already?" before the agent posts again.

#[cfg(feature = "embeddings")]
mod embedding;
mod graph;
pub mod hash;
mod node;
pub mod vector;

#[cfg(feature = "embeddings")]
pub use embedding::FastEmbedVectorizer;
pub use graph::{ContentGraph, DuplicateCheck, DuplicateReason, GraphStats, SimilarNode};
pub use hash::content_hash;
pub use node::{ContentGraphDocument, ContentNode, DEFAULT_SIMILARITY_THRESHOLD, is_valid_threshold};
pub use vector::{LetterFrequencyVectorizer, Vectorizer, cosine_similarity};
