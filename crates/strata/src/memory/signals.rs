//! Content-derived scoring signals
//!
//! Signals a write does not carry are estimated from its content. Emotional
//! impact and technical value use lexicon hits (a token hits when it starts
//! with a lexicon word, so inflections count). Relevance is measured in the
//! state space as the agreement between the content and the labels the
//! record was filed under (tags, subject, category).

use crate::embedding::hashing::tokenize;
use crate::embedding::{EmbeddingProvider, HashingEmbedder, inner_product};
use crate::error::Result;

const EMOTIONAL_WORDS: [&str; 24] = [
    "love", "hate", "amazing", "terrible", "wonderful", "awful", "happy", "sad", "excit",
    "afraid", "angry", "grateful", "proud", "ashamed", "worried", "delight", "furious",
    "heartbr", "thrill", "lonely", "anxious", "joy", "upset", "regret",
];

const TECHNICAL_WORDS: [&str; 24] = [
    "algorithm", "function", "compil", "database", "server", "protocol", "config", "deploy",
    "latency", "memory", "thread", "async", "schema", "index", "query", "vector", "encrypt",
    "kernel", "binary", "api", "error", "cache", "network", "rust",
];

/// Contribution of a single lexicon hit
const HIT_GAIN: f64 = 0.25;

/// Relevance reported when a record carries no labels
const NEUTRAL_RELEVANCE: f64 = 0.5;

pub struct SignalExtractor {
    state: HashingEmbedder,
}

impl SignalExtractor {
    pub fn new(state_dimension: usize) -> Result<Self> {
        Ok(Self {
            state: HashingEmbedder::state(state_dimension)?,
        })
    }

    pub fn state_provider_id(&self) -> &str {
        self.state.provider_id()
    }

    /// Estimated emotional impact in [0, 1]
    pub fn emotional_impact(&self, content: &str) -> f64 {
        lexicon_signal(content, &EMOTIONAL_WORDS)
    }

    /// Estimated technical value in [0, 1]
    pub fn technical_value(&self, content: &str) -> f64 {
        lexicon_signal(content, &TECHNICAL_WORDS)
    }

    /// Agreement between content and its labels in the state space, in [0, 1].
    /// Unrelated text sits near 0.5.
    pub fn relevance(&self, content: &str, labels: &[&str]) -> Result<f64> {
        let labels: Vec<&str> = labels
            .iter()
            .copied()
            .filter(|l| !l.trim().is_empty())
            .collect();
        if labels.is_empty() {
            return Ok(NEUTRAL_RELEVANCE);
        }
        let content_state = self.state.embed(content)?;
        let label_state = self.state.embed(&labels.join(" "))?;
        let agreement = inner_product(&content_state, &label_state) as f64;
        Ok((0.5 + 0.5 * agreement).clamp(0.0, 1.0))
    }
}

fn lexicon_signal(content: &str, lexicon: &[&str]) -> f64 {
    let hits = tokenize(content)
        .iter()
        .filter(|token| lexicon.iter().any(|word| token.starts_with(word)))
        .count();
    (hits as f64 * HIT_GAIN).min(1.0)
}
