//! Strata - tiered memory storage and retrieval
//!
//! Records land in one of three tiers: an append-only archive of encrypted
//! private frames and raw logs, a semantic store of curated records searched
//! by embedding similarity, and an in-memory fast index mirrored from the
//! semantic store. A router picks the tier for every write and query, and a
//! significance scorer decays what is retrieved over time.

pub mod archive;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod router;
pub mod storage;
pub mod testing;
pub mod vault;

pub use engine::Engine;
pub use error::StrataError;
