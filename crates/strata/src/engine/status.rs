//! Health and configuration snapshot

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::archive::ArchiveStats;
use crate::config::{HalfLives, ScoreWeights};
use crate::engine::Engine;
use crate::error::Result;
use crate::router::Tier;
use crate::storage::semantic::CollectionInfo;

#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FastStatus {
    pub enabled: bool,
    pub generation: u64,
    pub vectors: usize,
    pub stale: bool,
    /// Mirror commands not yet folded into a published generation
    pub queue_depth: usize,
    pub built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScorerStatus {
    pub weights: ScoreWeights,
    pub half_life_days: HalfLives,
    pub consolidation_k: f64,
    pub score_floor: f64,
    pub similarity_weight: f32,
    pub rerank_weight: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub layers: u8,
    /// Safe-to-log digest of the root secret
    pub root_fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub tiers: Vec<TierStatus>,
    pub archive: ArchiveStats,
    pub collections: Vec<CollectionInfo>,
    pub fast: FastStatus,
    pub scorer: ScorerStatus,
    pub vault: VaultStatus,
    pub embedding_provider: String,
    pub dimension: usize,
    pub rescore_running: bool,
}

impl Engine {
    pub async fn status(&self) -> Result<EngineStatus> {
        let tiers = Tier::ALL
            .iter()
            .map(|tier| TierStatus {
                tier: *tier,
                available: self.router.is_available(*tier),
            })
            .collect();

        let mut collections = Vec::new();
        if self.router.is_available(Tier::Semantic) {
            for name in self.semantic.collection_names() {
                match self.semantic.collection_info(&name).await {
                    Ok(info) => collections.push(info),
                    Err(e) => warn!(collection = %name, error = %e, "Failed to describe collection"),
                }
            }
        }

        let fast = match &self.sync {
            Some(sync) => {
                let snapshot = sync.index().snapshot();
                FastStatus {
                    enabled: true,
                    generation: snapshot.generation,
                    vectors: sync.index().len(),
                    stale: sync.index().is_stale(),
                    queue_depth: sync.queue_depth(),
                    built_at: Some(snapshot.built_at),
                }
            }
            None => FastStatus {
                enabled: false,
                generation: 0,
                vectors: 0,
                stale: false,
                queue_depth: 0,
                built_at: None,
            },
        };

        let scoring = &self.config.scoring;
        Ok(EngineStatus {
            tiers,
            archive: self.archive.stats(),
            collections,
            fast,
            scorer: ScorerStatus {
                weights: scoring.weights,
                half_life_days: scoring.half_life_days,
                consolidation_k: scoring.decay.consolidation_k,
                score_floor: scoring.decay.score_floor,
                similarity_weight: scoring.ranking.similarity_weight,
                rerank_weight: scoring.ranking.rerank_weight,
            },
            vault: VaultStatus {
                layers: self.vault.layer_count(),
                root_fingerprint: self.vault.fingerprint(),
            },
            embedding_provider: self.embedder.provider_id().to_string(),
            dimension: self.embedder.dimension(),
            rescore_running: self.rescoring.load(Ordering::Acquire),
        })
    }
}
