//! Significance scoring, decay and consolidation
//!
//! The base score is a weighted composite fixed at creation. The effective
//! score is derived lazily on read: exponential decay under the half-life of
//! the record's decay tier, then a logarithmic consolidation boost from
//! access count, capped at the base score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{HalfLives, ScoreWeights, ScoringConfig};
use crate::error::{Result, StrataError};

/// Decay tier, assigned once at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayTier {
    Critical,
    High,
    Medium,
    Low,
}

impl DecayTier {
    /// Tier implied by a base score when none is given explicitly
    pub fn for_base_score(base: f64) -> Self {
        if base >= 0.8 {
            DecayTier::Critical
        } else if base >= 0.6 {
            DecayTier::High
        } else if base >= 0.35 {
            DecayTier::Medium
        } else {
            DecayTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecayTier::Critical => "critical",
            DecayTier::High => "high",
            DecayTier::Medium => "medium",
            DecayTier::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "critical" => Ok(DecayTier::Critical),
            "high" => Ok(DecayTier::High),
            "medium" => Ok(DecayTier::Medium),
            "low" => Ok(DecayTier::Low),
            other => Err(StrataError::Validation(format!("Unknown decay tier: {other}"))),
        }
    }
}

/// Raw inputs of the composite score, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalValues {
    pub significance: f64,
    pub relevance: f64,
    pub emotional_impact: f64,
    pub technical_value: f64,
    pub user_rating: f64,
}

/// Derived scoring state carried by every stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceScore {
    /// Immutable composite score
    pub base: f64,
    pub tier: DecayTier,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    /// Cached effective score, refreshed by the rescoring job
    pub current: f64,
}

impl SignificanceScore {
    pub fn new(base: f64, tier: DecayTier, now: DateTime<Utc>) -> Self {
        Self {
            base,
            tier,
            access_count: 0,
            last_accessed: now,
            current: base,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoreWeights,
    half_lives: HalfLives,
    consolidation_k: f64,
    floor: f64,
}

impl Default for Scorer {
    fn default() -> Self {
        Self::from_config(&ScoringConfig::default())
    }
}

impl Scorer {
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self {
            weights: config.weights,
            half_lives: config.half_life_days,
            consolidation_k: config.decay.consolidation_k,
            floor: config.decay.score_floor,
        }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    /// `w1·significance + w2·relevance + w3·emotional + w4·technical + w5·rating`
    pub fn score(&self, signals: &SignalValues) -> f64 {
        let w = &self.weights;
        let composite = w.significance * signals.significance.clamp(0.0, 1.0)
            + w.relevance * signals.relevance.clamp(0.0, 1.0)
            + w.emotional_impact * signals.emotional_impact.clamp(0.0, 1.0)
            + w.technical_value * signals.technical_value.clamp(0.0, 1.0)
            + w.user_rating * signals.user_rating.clamp(0.0, 1.0);
        composite.clamp(0.0, 1.0)
    }

    pub fn half_life(&self, tier: DecayTier) -> f64 {
        match tier {
            DecayTier::Critical => self.half_lives.critical,
            DecayTier::High => self.half_lives.high,
            DecayTier::Medium => self.half_lives.medium,
            DecayTier::Low => self.half_lives.low,
        }
    }

    /// `score · exp(-ln2 / half_life · age_days)`; negative ages count as zero
    pub fn decay(&self, score: f64, age_days: f64, tier: DecayTier) -> f64 {
        let age = age_days.max(0.0);
        score * (-std::f64::consts::LN_2 / self.half_life(tier) * age).exp()
    }

    /// `min(decayed · (1 + k·ln(1 + access_count)), original_max)`
    pub fn consolidate(&self, decayed: f64, access_count: u32, original_max: f64) -> f64 {
        let boost = 1.0 + self.consolidation_k * (1.0 + access_count as f64).ln();
        (decayed * boost).min(original_max)
    }

    /// Effective score at `now`, computed from the immutable base
    pub fn effective(
        &self,
        score: &SignificanceScore,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        let age_days = age_in_days(created_at, now);
        let decayed = self.decay(score.base, age_days, score.tier);
        self.consolidate(decayed, score.access_count, score.base)
    }

    pub fn is_above_floor(&self, effective: f64) -> bool {
        effective >= self.floor
    }
}

/// Fractional days between two instants
pub fn age_in_days(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 86_400_000.0
}
