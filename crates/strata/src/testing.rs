//! Test utilities for strata - small, fast engine configurations
//!
//! Everything here uses the hashing embedder and cheap vault iteration counts
//! so tests run without downloading a model or spending seconds in PBKDF2.

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, EmbeddingProviderKind};
use crate::embedding::{EmbeddingProvider, HashingEmbedder};
use crate::engine::Engine;
use crate::error::Result;
use crate::vault::Vault;
use crate::vault::secret::RootSecret;

/// Semantic dimension used by test engines
pub const TEST_DIMENSION: usize = 64;

/// Vault iteration counts for tests
pub const TEST_LAYER_ITERATIONS: [u32; 3] = [10, 12, 14];

/// Engine configuration rooted at `data_dir`
pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config.archive.frames_per_chunk = 64;
    config.archive.sync_writes = false;
    config.fast.sync_interval_ms = 20;
    config.vault.layer_iterations = TEST_LAYER_ITERATIONS;
    config.embedding.provider = EmbeddingProviderKind::Hashing;
    config.embedding.dimension = TEST_DIMENSION;
    config
}

/// Hashing provider matching `test_config`
pub fn test_provider() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingEmbedder::semantic(TEST_DIMENSION).expect("test dimension is valid"))
}

/// Vault with the built-in secret and test iteration counts
pub fn test_vault() -> Vault {
    Vault::new(RootSecret::builtin(), TEST_LAYER_ITERATIONS).expect("test iterations are valid")
}

/// Open an engine over `data_dir` with `test_config`
pub async fn open_test_engine(data_dir: &Path) -> Result<Engine> {
    Engine::open_with_provider(test_config(data_dir), test_provider()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_valid() {
        let config = test_config(Path::new("/tmp/strata-test"));
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding.dimension, TEST_DIMENSION);
    }

    #[test]
    fn test_vault_round_trips() {
        let vault = test_vault();
        let capsule = vault.seal(b"hello", "capsule").unwrap();
        assert_eq!(vault.unseal(&capsule).unwrap(), b"hello");
    }
}
