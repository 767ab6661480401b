use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StrataError};

/// Main configuration structure for Strata
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage root (archive, semantic and fast-index subtrees)
    #[serde(default)]
    pub storage: StorageConfig,
    /// Archive tier configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Semantic tier configuration
    #[serde(default)]
    pub semantic: SemanticConfig,
    /// Fast index configuration
    #[serde(default)]
    pub fast: FastIndexConfig,
    /// Encryption vault configuration
    #[serde(default)]
    pub vault: VaultConfig,
    /// Significance scoring configuration
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Write/query routing configuration
    #[serde(default)]
    pub router: RouterConfig,
    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Config {
    /// Parse a TOML document and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let weights = &self.scoring.weights;
        let sum = weights.significance
            + weights.relevance
            + weights.emotional_impact
            + weights.technical_value
            + weights.user_rating;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(StrataError::Config(format!(
                "Scoring weights must sum to 1.0, got {sum}"
            )));
        }

        let half_lives = &self.scoring.half_life_days;
        for (name, days) in [
            ("critical", half_lives.critical),
            ("high", half_lives.high),
            ("medium", half_lives.medium),
            ("low", half_lives.low),
        ] {
            if days <= 0.0 {
                return Err(StrataError::Config(format!(
                    "Half-life for tier {name} must be positive, got {days}"
                )));
            }
        }

        if self.archive.frames_per_chunk == 0 {
            return Err(StrataError::Config(
                "archive.frames_per_chunk must be greater than zero".to_string(),
            ));
        }

        if self.vault.layer_iterations.iter().any(|&n| n == 0) {
            return Err(StrataError::Config(
                "vault.layer_iterations must all be greater than zero".to_string(),
            ));
        }

        if self.fast.queue_capacity == 0 {
            return Err(StrataError::Config(
                "fast.queue_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Storage root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all storage data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    pub fn semantic_dir(&self) -> PathBuf {
        self.data_dir.join("semantic")
    }

    pub fn fast_dir(&self) -> PathBuf {
        self.data_dir.join("fast")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

/// Archive tier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Number of frames sealed into one immutable chunk
    #[serde(default = "default_frames_per_chunk")]
    pub frames_per_chunk: usize,
    /// fsync each appended frame before acknowledging it
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            frames_per_chunk: default_frames_per_chunk(),
            sync_writes: default_sync_writes(),
        }
    }
}

fn default_frames_per_chunk() -> usize {
    50
}

fn default_sync_writes() -> bool {
    true
}

/// Semantic tier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SemanticConfig {
    /// Entry count above which a collection should be sharded
    #[serde(default = "default_shard_threshold")]
    pub shard_threshold: usize,
    /// Multiplier for the candidate pool fetched before reranking
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            shard_threshold: default_shard_threshold(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_shard_threshold() -> usize {
    500_000
}

fn default_candidate_multiplier() -> usize {
    3
}

/// Fast index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FastIndexConfig {
    /// Run the fast index and its background mirror
    #[serde(default = "default_fast_enabled")]
    pub enabled: bool,
    /// How often pending mirror entries are folded into a new generation.
    /// Each fold copies the index once, so shorter intervals cost more CPU.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Capacity of the bounded mirror queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for FastIndexConfig {
    fn default() -> Self {
        Self {
            enabled: default_fast_enabled(),
            sync_interval_ms: default_sync_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl FastIndexConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

fn default_fast_enabled() -> bool {
    true
}

fn default_sync_interval_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    1024
}

/// Encryption vault configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// PBKDF2 iteration counts for layers one, two and three
    #[serde(default = "default_layer_iterations")]
    pub layer_iterations: [u32; 3],
    /// Environment variable holding a hex-encoded operator secret
    #[serde(default)]
    pub operator_secret_env: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            layer_iterations: default_layer_iterations(),
            operator_secret_env: None,
        }
    }
}

fn default_layer_iterations() -> [u32; 3] {
    [60_000, 80_000, 100_000]
}

/// Significance scoring configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: ScoreWeights,
    #[serde(default)]
    pub half_life_days: HalfLives,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
}

/// Weights of the composite significance score (must sum to 1.0)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreWeights {
    #[serde(default = "default_w_significance")]
    pub significance: f64,
    #[serde(default = "default_w_relevance")]
    pub relevance: f64,
    #[serde(default = "default_w_emotional")]
    pub emotional_impact: f64,
    #[serde(default = "default_w_technical")]
    pub technical_value: f64,
    #[serde(default = "default_w_rating")]
    pub user_rating: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            significance: default_w_significance(),
            relevance: default_w_relevance(),
            emotional_impact: default_w_emotional(),
            technical_value: default_w_technical(),
            user_rating: default_w_rating(),
        }
    }
}

fn default_w_significance() -> f64 {
    0.30
}

fn default_w_relevance() -> f64 {
    0.20
}

fn default_w_emotional() -> f64 {
    0.15
}

fn default_w_technical() -> f64 {
    0.20
}

fn default_w_rating() -> f64 {
    0.15
}

/// Half-life in days for each decay tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HalfLives {
    #[serde(default = "default_hl_critical")]
    pub critical: f64,
    #[serde(default = "default_hl_high")]
    pub high: f64,
    #[serde(default = "default_hl_medium")]
    pub medium: f64,
    #[serde(default = "default_hl_low")]
    pub low: f64,
}

impl Default for HalfLives {
    fn default() -> Self {
        Self {
            critical: default_hl_critical(),
            high: default_hl_high(),
            medium: default_hl_medium(),
            low: default_hl_low(),
        }
    }
}

fn default_hl_critical() -> f64 {
    730.0
}

fn default_hl_high() -> f64 {
    182.0
}

fn default_hl_medium() -> f64 {
    30.0
}

fn default_hl_low() -> f64 {
    7.0
}

/// Decay, consolidation and background rescoring
#[derive(Debug, Clone, Deserialize)]
pub struct DecayConfig {
    /// Consolidation strength per ln(1 + access_count)
    #[serde(default = "default_consolidation_k")]
    pub consolidation_k: f64,
    /// Effective scores below this are excluded from default result sets
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    /// Interval of the cached-score refresh job
    #[serde(default = "default_rescore_interval_secs")]
    pub rescore_interval_secs: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            consolidation_k: default_consolidation_k(),
            score_floor: default_score_floor(),
            rescore_interval_secs: default_rescore_interval_secs(),
        }
    }
}

fn default_consolidation_k() -> f64 {
    0.1
}

fn default_score_floor() -> f64 {
    0.05
}

fn default_rescore_interval_secs() -> u64 {
    3600
}

/// Blend of similarity and effective score in the final ranking
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RankingConfig {
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    #[serde(default = "default_rerank_weight")]
    pub rerank_weight: f32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            rerank_weight: default_rerank_weight(),
        }
    }
}

fn default_similarity_weight() -> f32 {
    0.7
}

fn default_rerank_weight() -> f32 {
    0.3
}

/// What to do when a write cannot be classified with confidence
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguousPolicy {
    /// Treat the write as private (sealed, archive only)
    #[default]
    Restrict,
    /// Reject the write with `ClassificationAmbiguous`
    Reject,
}

/// Write/query routing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Queries with at most this many words and no filter go to the fast tier
    #[serde(default = "default_short_query_max_words")]
    pub short_query_max_words: usize,
    #[serde(default)]
    pub ambiguous_policy: AmbiguousPolicy,
    /// Per-tier query budget
    #[serde(default = "default_tier_timeout_ms")]
    pub tier_timeout_ms: u64,
    /// Fast-tier candidates fetched per requested hybrid result
    #[serde(default = "default_hybrid_candidate_multiplier")]
    pub hybrid_candidate_multiplier: usize,
    /// Also append curated records to the archive as raw frames
    #[serde(default)]
    pub archive_backup: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            short_query_max_words: default_short_query_max_words(),
            ambiguous_policy: AmbiguousPolicy::default(),
            tier_timeout_ms: default_tier_timeout_ms(),
            hybrid_candidate_multiplier: default_hybrid_candidate_multiplier(),
            archive_backup: false,
        }
    }
}

impl RouterConfig {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }
}

fn default_short_query_max_words() -> usize {
    4
}

fn default_tier_timeout_ms() -> u64 {
    2000
}

fn default_hybrid_candidate_multiplier() -> usize {
    4
}

/// Which embedding provider backs the semantic space
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local ONNX model through fastembed
    #[default]
    Fastembed,
    /// Deterministic feature hashing (no model download)
    Hashing,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    /// Semantic space dimension (used by the hashing provider)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// State space dimension used for scoring signals
    #[serde(default = "default_state_dimension")]
    pub state_dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            dimension: default_embedding_dimension(),
            state_dimension: default_state_dimension(),
        }
    }
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_state_dimension() -> usize {
    64
}
