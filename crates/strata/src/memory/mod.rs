//! Memory records and significance scoring
//!
//! Defines the record shapes stored in the semantic tier, the write and
//! recall types shared by the engine, and the scorer that decays and
//! consolidates significance over time.

pub mod significance;
pub mod signals;
pub mod types;

pub use significance::{DecayTier, Scorer, SignalValues, SignificanceScore};
pub use signals::SignalExtractor;
pub use types::{
    ArchivedEntry, Classification, ContentKind, MemoryRecord, Recalled, RecordKind, Sensitivity,
    WriteItem,
};
