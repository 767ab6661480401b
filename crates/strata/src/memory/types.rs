//! Record types for Strata
//!
//! A stored memory is a closed tagged union keyed by `kind`. Every variant
//! shares the same envelope (ids, timestamps, scores, tags) and carries only
//! its own fields.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::significance::{DecayTier, SignificanceScore};
use crate::storage::metadata::MetadataValue;

/// Variant-specific part of a memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    CuratedInsight {
        content: String,
        category: Option<String>,
    },
    ExtractedFact {
        content: String,
        subject: Option<String>,
        source: Option<String>,
    },
    FlexibleRecord {
        content: String,
        record_type: String,
        payload: serde_json::Value,
    },
    /// Pointer to sealed archive content; never embedded
    PrivateReference {
        capsule_id: String,
        frame_id: String,
        label: Option<String>,
    },
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::CuratedInsight { .. } => "curated_insight",
            RecordKind::ExtractedFact { .. } => "extracted_fact",
            RecordKind::FlexibleRecord { .. } => "flexible_record",
            RecordKind::PrivateReference { .. } => "private_reference",
        }
    }

    /// Searchable text; `None` for private references
    pub fn content(&self) -> Option<&str> {
        match self {
            RecordKind::CuratedInsight { content, .. }
            | RecordKind::ExtractedFact { content, .. }
            | RecordKind::FlexibleRecord { content, .. } => Some(content),
            RecordKind::PrivateReference { .. } => None,
        }
    }

    /// Semantic collection holding this kind
    pub fn collection(&self) -> Option<&'static str> {
        match self {
            RecordKind::CuratedInsight { .. } => Some(INSIGHTS_COLLECTION),
            RecordKind::ExtractedFact { .. } => Some(FACTS_COLLECTION),
            RecordKind::FlexibleRecord { .. } => Some(RECORDS_COLLECTION),
            RecordKind::PrivateReference { .. } => None,
        }
    }
}

pub const INSIGHTS_COLLECTION: &str = "insights";
pub const FACTS_COLLECTION: &str = "facts";
pub const RECORDS_COLLECTION: &str = "records";

/// Built-in semantic collections, in query fan-out order
pub const BUILTIN_COLLECTIONS: [&str; 3] =
    [INSIGHTS_COLLECTION, FACTS_COLLECTION, RECORDS_COLLECTION];

/// A memory as stored in (or recalled from) the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Always >= `created_at`
    pub updated_at: DateTime<Utc>,
    pub significance: f64,
    pub confidence: f64,
    /// Empty for private references
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    /// Record this one replaces
    pub supersedes: Option<Uuid>,
    /// Set once a newer record supersedes this one
    pub superseded_by: Option<Uuid>,
    pub score: SignificanceScore,
    #[serde(flatten)]
    pub kind: RecordKind,
}

impl MemoryRecord {
    pub fn is_private(&self) -> bool {
        matches!(self.kind, RecordKind::PrivateReference { .. })
    }

    pub fn content(&self) -> Option<&str> {
        self.kind.content()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Scalar metadata columns for the semantic store
    pub fn to_metadata(&self) -> Result<BTreeMap<String, MetadataValue>> {
        let mut meta = BTreeMap::new();
        let mut put = |key: &str, value: MetadataValue| {
            meta.insert(key.to_string(), value);
        };

        put("kind", MetadataValue::from(self.kind.as_str()));
        put("created_at", MetadataValue::Integer(self.created_at.timestamp_micros()));
        put("updated_at", MetadataValue::Integer(self.updated_at.timestamp_micros()));
        put("significance", MetadataValue::Float(self.significance));
        put("confidence", MetadataValue::Float(self.confidence));
        put("base_score", MetadataValue::Float(self.score.base));
        put("current_score", MetadataValue::Float(self.score.current));
        put("decay_tier", MetadataValue::from(self.score.tier.as_str()));
        put("access_count", MetadataValue::Integer(i64::from(self.score.access_count)));
        put(
            "last_accessed",
            MetadataValue::Integer(self.score.last_accessed.timestamp_micros()),
        );
        put("tags", MetadataValue::encode_json(&self.tags)?);
        if let Some(supersedes) = self.supersedes {
            put("supersedes", MetadataValue::String(supersedes.to_string()));
        }
        if let Some(by) = self.superseded_by {
            put("superseded_by", MetadataValue::String(by.to_string()));
        }

        match &self.kind {
            RecordKind::CuratedInsight { content, category } => {
                put("content", MetadataValue::from(content.as_str()));
                if let Some(category) = category {
                    put("category", MetadataValue::from(category.as_str()));
                }
            }
            RecordKind::ExtractedFact {
                content,
                subject,
                source,
            } => {
                put("content", MetadataValue::from(content.as_str()));
                if let Some(subject) = subject {
                    put("subject", MetadataValue::from(subject.as_str()));
                }
                if let Some(source) = source {
                    put("source", MetadataValue::from(source.as_str()));
                }
            }
            RecordKind::FlexibleRecord {
                content,
                record_type,
                payload,
            } => {
                put("content", MetadataValue::from(content.as_str()));
                put("record_type", MetadataValue::from(record_type.as_str()));
                put("payload", MetadataValue::encode_json(payload)?);
            }
            RecordKind::PrivateReference { .. } => {
                return Err(StrataError::Validation(
                    "Private references cannot be stored in the semantic tier".to_string(),
                ));
            }
        }

        Ok(meta)
    }

    /// Rebuild a record from a semantic-store row
    pub fn from_metadata(
        id: Uuid,
        embedding: Vec<f32>,
        meta: &BTreeMap<String, MetadataValue>,
    ) -> Result<Self> {
        let text = |key: &str| -> Option<String> {
            meta.get(key).and_then(|v| v.as_str()).map(str::to_string)
        };
        let required_text = |key: &str| -> Result<String> {
            text(key).ok_or_else(|| missing_field(key))
        };
        let integer = |key: &str| -> Result<i64> {
            meta.get(key)
                .and_then(MetadataValue::as_i64)
                .ok_or_else(|| missing_field(key))
        };
        let float = |key: &str| -> Result<f64> {
            meta.get(key)
                .and_then(MetadataValue::as_f64)
                .ok_or_else(|| missing_field(key))
        };
        let uuid = |key: &str| -> Result<Option<Uuid>> {
            text(key)
                .map(|s| {
                    Uuid::parse_str(&s)
                        .map_err(|e| StrataError::Storage(format!("Failed to parse {key}: {e}")))
                })
                .transpose()
        };

        let content = required_text("content")?;
        let kind = match required_text("kind")?.as_str() {
            "curated_insight" => RecordKind::CuratedInsight {
                content,
                category: text("category"),
            },
            "extracted_fact" => RecordKind::ExtractedFact {
                content,
                subject: text("subject"),
                source: text("source"),
            },
            "flexible_record" => RecordKind::FlexibleRecord {
                content,
                record_type: required_text("record_type")?,
                payload: match meta.get("payload") {
                    Some(value) => value.decode_json()?,
                    None => serde_json::Value::Null,
                },
            },
            other => {
                return Err(StrataError::Storage(format!(
                    "Unknown record kind in semantic tier: {other}"
                )));
            }
        };

        let tags: Vec<String> = match meta.get("tags") {
            Some(value) => value.decode_json()?,
            None => Vec::new(),
        };

        let access_count = u32::try_from(integer("access_count")?.max(0)).unwrap_or(u32::MAX);

        Ok(Self {
            id,
            created_at: micros_to_datetime(integer("created_at")?)?,
            updated_at: micros_to_datetime(integer("updated_at")?)?,
            significance: float("significance")?,
            confidence: float("confidence")?,
            embedding,
            tags,
            supersedes: uuid("supersedes")?,
            superseded_by: uuid("superseded_by")?,
            score: SignificanceScore {
                base: float("base_score")?,
                tier: DecayTier::parse(&required_text("decay_tier")?)?,
                access_count,
                last_accessed: micros_to_datetime(integer("last_accessed")?)?,
                current: float("current_score")?,
            },
            kind,
        })
    }
}

fn missing_field(key: &str) -> StrataError {
    StrataError::Storage(format!("Stored record is missing field {key}"))
}

pub(crate) fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| StrataError::Storage(format!("Invalid timestamp: {micros}")))
}

/// Explicit sensitivity flag on a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Standard,
    Private,
}

/// Content-kind tag used when no sensitivity flag is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Insight,
    Fact,
    Flexible,
    Dialogue,
    Snapshot,
    Private,
}

impl ContentKind {
    /// Parse a caller-supplied kind tag; `None` when the tag is unknown
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "insight" | "curated_insight" => Some(ContentKind::Insight),
            "fact" | "extracted_fact" => Some(ContentKind::Fact),
            "flexible" | "flexible_record" | "record" => Some(ContentKind::Flexible),
            "dialogue" | "conversation" => Some(ContentKind::Dialogue),
            "snapshot" => Some(ContentKind::Snapshot),
            "private" | "private_reference" => Some(ContentKind::Private),
            _ => None,
        }
    }
}

/// Caller's description of a write, resolved by the router
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub sensitivity: Option<Sensitivity>,
    /// Raw kind tag; unknown tags count as ambiguous
    pub kind: Option<String>,
}

impl Classification {
    pub fn private() -> Self {
        Self {
            sensitivity: Some(Sensitivity::Private),
            kind: None,
        }
    }

    pub fn kind(kind: ContentKind) -> Self {
        let tag = match kind {
            ContentKind::Insight => "insight",
            ContentKind::Fact => "fact",
            ContentKind::Flexible => "flexible",
            ContentKind::Dialogue => "dialogue",
            ContentKind::Snapshot => "snapshot",
            ContentKind::Private => "private",
        };
        Self::tagged(tag)
    }

    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            sensitivity: None,
            kind: Some(tag.into()),
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }
}

/// Content and scoring inputs for a write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub content: String,
    pub category: Option<String>,
    pub subject: Option<String>,
    pub source: Option<String>,
    pub record_type: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// Short caller label for private content (sealed with it)
    pub label: Option<String>,
    pub significance: f64,
    pub relevance: Option<f64>,
    pub emotional_impact: Option<f64>,
    pub technical_value: Option<f64>,
    pub user_rating: Option<f64>,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub decay_tier: Option<DecayTier>,
    pub supersedes: Option<Uuid>,
    /// Overrides the creation time (imports, tests)
    pub created_at: Option<DateTime<Utc>>,
}

impl WriteItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: None,
            subject: None,
            source: None,
            record_type: None,
            payload: None,
            label: None,
            significance: 0.5,
            relevance: None,
            emotional_impact: None,
            technical_value: None,
            user_rating: None,
            confidence: 1.0,
            tags: Vec::new(),
            decay_tier: None,
            supersedes: None,
            created_at: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = Some(record_type.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_significance(mut self, significance: f64) -> Self {
        self.significance = significance;
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_emotional_impact(mut self, value: f64) -> Self {
        self.emotional_impact = Some(value);
        self
    }

    pub fn with_technical_value(mut self, value: f64) -> Self {
        self.technical_value = Some(value);
        self
    }

    pub fn with_user_rating(mut self, rating: f64) -> Self {
        self.user_rating = Some(rating);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_decay_tier(mut self, tier: DecayTier) -> Self {
        self.decay_tier = Some(tier);
        self
    }

    pub fn superseding(mut self, id: Uuid) -> Self {
        self.supersedes = Some(id);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Reject malformed items before anything is written
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(StrataError::Validation("Content must not be empty".to_string()));
        }
        check_unit("significance", Some(self.significance))?;
        check_unit("confidence", Some(self.confidence))?;
        check_unit("relevance", self.relevance)?;
        check_unit("emotional_impact", self.emotional_impact)?;
        check_unit("technical_value", self.technical_value)?;
        check_unit("user_rating", self.user_rating)?;
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(StrataError::Validation("Tags must not be empty".to_string()));
        }
        if let Some(created_at) = self.created_at {
            if created_at > Utc::now() + chrono::Duration::minutes(5) {
                return Err(StrataError::Validation(
                    "Creation time lies in the future".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || !(0.0..=1.0).contains(&v) => Err(StrataError::Validation(
            format!("{name} must be within [0, 1], got {v}"),
        )),
        _ => Ok(()),
    }
}

/// Content persisted in an archive frame (sealed for private writes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedEntry {
    pub record_id: Uuid,
    pub kind: ContentKind,
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub significance: f64,
    pub confidence: f64,
    pub score: SignificanceScore,
}

impl ArchivedEntry {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| StrataError::Serialization(format!("Failed to encode entry: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StrataError::Serialization(format!("Failed to decode entry: {e}")))
    }

    /// Record pointing at the sealed frame this entry came from
    pub fn reference(&self, frame_id: &str, capsule_id: &str) -> MemoryRecord {
        MemoryRecord {
            id: self.record_id,
            created_at: self.created_at,
            updated_at: self.created_at,
            significance: self.significance,
            confidence: self.confidence,
            embedding: Vec::new(),
            tags: self.tags.clone(),
            supersedes: None,
            superseded_by: None,
            score: self.score.clone(),
            kind: RecordKind::PrivateReference {
                capsule_id: capsule_id.to_string(),
                frame_id: frame_id.to_string(),
                label: self.label.clone(),
            },
        }
    }

    /// Scalar view used to evaluate metadata filters against archive content
    pub fn metadata(&self) -> Result<BTreeMap<String, MetadataValue>> {
        let mut meta = BTreeMap::new();
        let kind = match self.kind {
            ContentKind::Private => "private_reference",
            ContentKind::Dialogue => "dialogue",
            ContentKind::Snapshot => "snapshot",
            ContentKind::Insight => "curated_insight",
            ContentKind::Fact => "extracted_fact",
            ContentKind::Flexible => "flexible_record",
        };
        meta.insert("kind".to_string(), MetadataValue::from(kind));
        meta.insert(
            "created_at".to_string(),
            MetadataValue::Integer(self.created_at.timestamp_micros()),
        );
        meta.insert("significance".to_string(), MetadataValue::Float(self.significance));
        meta.insert("confidence".to_string(), MetadataValue::Float(self.confidence));
        meta.insert("base_score".to_string(), MetadataValue::Float(self.score.base));
        meta.insert(
            "decay_tier".to_string(),
            MetadataValue::from(self.score.tier.as_str()),
        );
        meta.insert("tags".to_string(), MetadataValue::encode_json(&self.tags)?);
        if let Some(label) = &self.label {
            meta.insert("label".to_string(), MetadataValue::from(label.as_str()));
        }
        Ok(meta)
    }
}

/// Result of `recall`
#[derive(Debug, Clone, PartialEq)]
pub enum Recalled {
    /// Curated record from the semantic tier
    Record(MemoryRecord),
    /// Archive frame; private frames come back unsealed with a reference record
    Archived {
        frame_id: String,
        sealed: bool,
        entry: ArchivedEntry,
        reference: Option<MemoryRecord>,
    },
}

impl Recalled {
    pub fn content(&self) -> Option<&str> {
        match self {
            Recalled::Record(record) => record.content(),
            Recalled::Archived { entry, .. } => Some(&entry.content),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Recalled::Record(record) => record.id,
            Recalled::Archived { entry, .. } => entry.record_id,
        }
    }
}
