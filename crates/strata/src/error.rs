//! Error types for Strata

use thiserror::Error;

/// Main error type for Strata operations
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed record, metadata type, filter or request
    #[error("Validation error: {0}")]
    Validation(String),

    /// The router could not safely decide a tier for a write
    #[error("Ambiguous classification: {0}")]
    ClassificationAmbiguous(String),

    /// Authentication failure while unsealing a capsule
    #[error("Decryption failed for capsule {capsule_id}")]
    Decryption { capsule_id: String },

    /// A backing tier is unreachable or switched off
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// A per-tier query budget was exceeded
    #[error("Query on tier {tier} exceeded {budget_ms}ms")]
    QueryTimeout { tier: String, budget_ms: u64 },

    /// Archive integrity check failed
    #[error("Corrupt frame in chunk {chunk} at offset {offset}: {reason}")]
    CorruptFrame {
        chunk: u64,
        offset: u64,
        reason: String,
    },

    /// Collection was written by a different embedding provider
    #[error("Collection {collection} requires migration: {reason}")]
    MigrationRequired { collection: String, reason: String },

    /// Requested id is not present in any tier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors (LanceDB, chunk files, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StrataError {
    pub fn tier_unavailable(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: tier.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
