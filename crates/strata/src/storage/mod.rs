//! Semantic and fast tiers
//!
//! The semantic store is the authoritative vector tier; the fast index is a
//! rebuildable in-memory mirror of it, maintained by the sync worker.

pub mod fast;
pub mod filter;
pub mod metadata;
pub mod semantic;
pub mod sync;

pub use fast::{FastEntry, FastHit, FastIndex, IndexGeneration};
pub use filter::{MetadataFilter, Predicate};
pub use metadata::{
    CollectionManifest, CollectionSchema, FieldSpec, MetadataValue, ScalarKind, ShardPolicy,
};
pub use semantic::{CollectionInfo, SemanticEntry, SemanticHit, SemanticStore};
pub use sync::SyncHandle;
