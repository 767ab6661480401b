//! Deterministic feature-hashing embedder
//!
//! Tokens and character trigrams are hashed into signed buckets and the result
//! is L2-normalized. Texts that share words land near each other, which is
//! enough for the state space and for model-free deployments and tests.

use crate::embedding::{EmbeddingProvider, normalize};
use crate::error::{Result, StrataError};

const TRIGRAM_WEIGHT: f32 = 0.35;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    provider_id: String,
}

impl HashingEmbedder {
    /// Embedder for the semantic space
    pub fn semantic(dimension: usize) -> Result<Self> {
        Self::with_prefix("hashing-v1", dimension)
    }

    /// Embedder for the fixed-dimension state space
    pub fn state(dimension: usize) -> Result<Self> {
        Self::with_prefix("state-hashing-v1", dimension)
    }

    fn with_prefix(prefix: &str, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(StrataError::Config(
                "Embedding dimension must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            provider_id: format!("{prefix}/{dimension}"),
        })
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = crc32fast::hash(feature);
        let bucket = (hash as usize) % self.dimension;
        let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

/// Lowercased alphanumeric tokens of `content`
pub fn tokenize(content: &str) -> Vec<String> {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl EmbeddingProvider for HashingEmbedder {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, content: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = tokenize(content);

        if tokens.is_empty() {
            self.add_feature(&mut vector, content.as_bytes(), 1.0);
        }

        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);

            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.add_feature(&mut vector, trigram.as_bytes(), TRIGRAM_WEIGHT);
                }
            }
        }

        normalize(&mut vector);
        if vector.iter().all(|v| *v == 0.0) {
            // Features cancelled out; fall back to a stable unit vector
            let bucket = (crc32fast::hash(content.as_bytes()) as usize) % self.dimension;
            vector[bucket] = 1.0;
        }
        Ok(vector)
    }
}
