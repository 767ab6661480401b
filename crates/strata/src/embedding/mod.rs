//! Embedding providers
//!
//! The engine consumes embeddings through the narrow [`EmbeddingProvider`]
//! contract: deterministic for identical input, L2-normalized and of a fixed
//! dimension. Two spaces exist. The semantic space backs the semantic store
//! and fast index; the state space is a small fixed-dimension space used only
//! for internal scoring signals.

pub mod hashing;

use std::sync::Arc;

use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{Result, StrataError};

pub use hashing::HashingEmbedder;

/// Dimension of the multilingual-e5-small model
pub const FASTEMBED_DIMENSION: usize = 384;

/// Maps content to a fixed-length, L2-normalized vector.
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier recorded next to stored vectors
    fn provider_id(&self) -> &str;

    /// Output dimension
    fn dimension(&self) -> usize;

    fn embed(&self, content: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, contents: &[String]) -> Result<Vec<Vec<f32>>> {
        contents.iter().map(|c| self.embed(c)).collect()
    }
}

/// fastembed-backed provider for the semantic space
pub struct FastEmbedProvider {
    model: Mutex<TextEmbedding>,
    provider_id: String,
}

impl FastEmbedProvider {
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(InitOptions::new(FastEmbedModel::MultilingualE5Small))
            .map_err(|e| StrataError::Embedding(format!("Failed to load embedding model: {e}")))?;
        Ok(Self {
            model: Mutex::new(model),
            provider_id: format!("fastembed/multilingual-e5-small/{FASTEMBED_DIMENSION}"),
        })
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn dimension(&self) -> usize {
        FASTEMBED_DIMENSION
    }

    fn embed(&self, content: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(&[content.to_string()])?;
        embeddings
            .pop()
            .ok_or_else(|| StrataError::Embedding("No embedding returned".to_string()))
    }

    fn embed_batch(&self, contents: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = self
            .model
            .lock()
            .embed(contents.to_vec(), None)
            .map_err(|e| StrataError::Embedding(e.to_string()))?;
        for embedding in &mut embeddings {
            normalize(embedding);
        }
        Ok(embeddings)
    }
}

/// Build the semantic-space provider selected in the configuration
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        EmbeddingProviderKind::Fastembed => Ok(Arc::new(FastEmbedProvider::new()?)),
        EmbeddingProviderKind::Hashing => {
            Ok(Arc::new(HashingEmbedder::semantic(config.dimension)?))
        }
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Inner product; equals cosine similarity for normalized inputs
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Check that `vector` has the expected dimension and finite components
pub fn check_vector(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.len() != dimension {
        return Err(StrataError::Validation(format!(
            "Embedding has dimension {}, expected {dimension}",
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(StrataError::Validation(
            "Embedding contains non-finite values".to_string(),
        ));
    }
    Ok(())
}
