use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::vector::Vectorizer;
use crate::Result;

/// Vectorizer backed by a local transformer model
pub struct FastEmbedVectorizer {
    model: TextEmbedding,
    dimensions: usize,
}

impl FastEmbedVectorizer {
    /// all-MiniLM-L6-v2 output width
    const MINILM_DIMENSIONS: usize = 384;

    /// Create a new vectorizer with the default model
    pub fn new() -> Result<Self> {
        let mut options = InitOptions::default();
        options.model_name = EmbeddingModel::AllMiniLML6V2;
        options.show_download_progress = false;

        let model = TextEmbedding::try_new(options)
            .map_err(|e| crate::Error::Embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model,
            dimensions: Self::MINILM_DIMENSIONS,
        })
    }
}

#[async_trait]
impl Vectorizer for FastEmbedVectorizer {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self
            .model
            .embed(vec![text.to_string()], None)
            .map_err(|e| crate::Error::Embedding(format!("Embedding generation failed: {}", e)))?;

        if embeddings.is_empty() {
            return Err(crate::Error::Embedding("Model returned no embedding".to_string()));
        }
        let vector = embeddings.remove(0);
        if vector.len() != self.dimensions {
            return Err(crate::Error::Embedding(format!(
                "Expected {} dimensions, model returned {}",
                self.dimensions,
                vector.len()
            )));
        }
        Ok(vector)
    }
}
