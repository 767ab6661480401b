//! Scalar metadata and collection schemas
//!
//! Metadata at the storage boundary is a closed union of string, integer and
//! float. Anything structured is encoded to a JSON string on write and
//! decoded on read.

use std::collections::BTreeMap;

use chrono::{Datelike, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
}

impl MetadataValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            MetadataValue::String(_) => ScalarKind::String,
            MetadataValue::Integer(_) => ScalarKind::Integer,
            MetadataValue::Float(_) => ScalarKind::Float,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and integers widened to float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(f) => Some(*f),
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::String(_) => None,
        }
    }

    /// Serialize a structured value into a string scalar
    pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_string(value)
            .map(MetadataValue::String)
            .map_err(|e| StrataError::Serialization(format!("Failed to encode metadata: {e}")))
    }

    /// Inverse of [`MetadataValue::encode_json`]
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self.as_str().ok_or_else(|| {
            StrataError::Serialization("Structured metadata must be stored as a string".to_string())
        })?;
        serde_json::from_str(raw)
            .map_err(|e| StrataError::Serialization(format!("Failed to decode metadata: {e}")))
    }

    /// SQL literal with single quotes escaped
    pub fn to_sql_literal(&self) -> String {
        match self {
            MetadataValue::String(s) => format!("'{}'", escape_sql(s)),
            MetadataValue::Integer(i) => i.to_string(),
            MetadataValue::Float(f) => format_float(*f),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

pub(crate) fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}

/// Float literal that always parses back as a float
pub(crate) fn format_float(value: f64) -> String {
    let s = format!("{value:?}");
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{s}.0")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    String,
    Integer,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ScalarKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Column names reserved by the store itself
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "embedding", "_distance"];

/// Declared metadata columns of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub fields: Vec<FieldSpec>,
}

impl CollectionSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for field in &fields {
            if !is_identifier(&field.name) {
                return Err(StrataError::Validation(format!(
                    "Invalid metadata field name: {}",
                    field.name
                )));
            }
            if RESERVED_COLUMNS.contains(&field.name.as_str()) {
                return Err(StrataError::Validation(format!(
                    "Metadata field name is reserved: {}",
                    field.name
                )));
            }
            if !seen.insert(field.name.clone()) {
                return Err(StrataError::Validation(format!(
                    "Duplicate metadata field: {}",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Schema shared by the built-in record collections
    pub fn memory_records() -> Self {
        use ScalarKind::*;
        let fields = [
            ("kind", String),
            ("content", String),
            ("category", String),
            ("subject", String),
            ("source", String),
            ("record_type", String),
            ("payload", String),
            ("created_at", Integer),
            ("updated_at", Integer),
            ("significance", Float),
            ("confidence", Float),
            ("base_score", Float),
            ("current_score", Float),
            ("decay_tier", String),
            ("access_count", Integer),
            ("last_accessed", Integer),
            ("tags", String),
            ("supersedes", String),
            ("superseded_by", String),
        ]
        .into_iter()
        .map(|(name, kind)| FieldSpec::new(name, kind))
        .collect();
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Reject undeclared keys and values of the wrong scalar kind.
    /// Integers are accepted for float columns.
    pub fn check(&self, metadata: &BTreeMap<String, MetadataValue>) -> Result<()> {
        for (key, value) in metadata {
            let field = self.field(key).ok_or_else(|| {
                StrataError::Validation(format!("Unknown metadata field: {key}"))
            })?;
            let compatible = match (field.kind, value) {
                (ScalarKind::Float, MetadataValue::Integer(_)) => true,
                (ScalarKind::Float, MetadataValue::Float(f)) => f.is_finite(),
                (kind, value) => kind == value.kind(),
            };
            if !compatible {
                return Err(StrataError::Validation(format!(
                    "Metadata field {key} expects {:?}, got {value:?}",
                    field.kind
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// How a collection is split into tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", content = "field", rename_all = "snake_case")]
pub enum ShardPolicy {
    #[default]
    None,
    /// One shard per calendar month of an integer microsecond timestamp field
    ByMonth(String),
    /// One shard per distinct value of a string field
    ByField(String),
}

impl ShardPolicy {
    /// Deterministic shard key for a row; equal rows always land in the same shard
    pub fn shard_key(&self, metadata: &BTreeMap<String, MetadataValue>) -> Result<String> {
        match self {
            ShardPolicy::None => Ok("all".to_string()),
            ShardPolicy::ByMonth(field) => {
                let micros = metadata
                    .get(field)
                    .and_then(MetadataValue::as_i64)
                    .ok_or_else(|| {
                        StrataError::Validation(format!(
                            "Shard field {field} must be an integer timestamp"
                        ))
                    })?;
                let at = Utc.timestamp_micros(micros).single().ok_or_else(|| {
                    StrataError::Validation(format!("Invalid shard timestamp: {micros}"))
                })?;
                Ok(format!("{:04}_{:02}", at.year(), at.month()))
            }
            ShardPolicy::ByField(field) => {
                let value = metadata
                    .get(field)
                    .and_then(MetadataValue::as_str)
                    .unwrap_or("none");
                Ok(sanitize_key(value))
            }
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            ShardPolicy::None => None,
            ShardPolicy::ByMonth(field) | ShardPolicy::ByField(field) => Some(field),
        }
    }
}

fn sanitize_key(value: &str) -> String {
    let key: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    if key.is_empty() { "none".to_string() } else { key }
}

pub const SCHEMA_VERSION: u32 = 1;

/// Persisted description of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub name: String,
    pub dimension: usize,
    pub provider_id: String,
    pub schema_version: u32,
    /// Bumped by every migration or reshard; part of the table names
    pub generation: u32,
    pub schema: CollectionSchema,
    #[serde(default)]
    pub shard_policy: ShardPolicy,
    /// Shard key -> table name
    #[serde(default)]
    pub shards: BTreeMap<String, String>,
}

impl CollectionManifest {
    pub fn new(
        name: &str,
        dimension: usize,
        provider_id: &str,
        schema: CollectionSchema,
        shard_policy: ShardPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            dimension,
            provider_id: provider_id.to_string(),
            schema_version: SCHEMA_VERSION,
            generation: 1,
            schema,
            shard_policy,
            shards: BTreeMap::new(),
        }
    }

    pub fn table_name(&self, shard_key: &str) -> String {
        format!("{}_g{}_{}", self.name, self.generation, shard_key)
    }

    /// Why this collection cannot serve the active provider, if it cannot
    pub fn incompatibility(&self, dimension: usize, provider_id: &str) -> Option<String> {
        if self.dimension != dimension {
            Some(format!(
                "stored dimension {} differs from provider dimension {dimension}",
                self.dimension
            ))
        } else if self.provider_id != provider_id {
            Some(format!(
                "stored provider {} differs from active provider {provider_id}",
                self.provider_id
            ))
        } else if self.schema_version != SCHEMA_VERSION {
            Some(format!(
                "schema version {} differs from {SCHEMA_VERSION}",
                self.schema_version
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, MetadataValue)]) -> BTreeMap<String, MetadataValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    mod values {
        use super::*;

        #[test]
        fn test_json_roundtrip_through_string() {
            let tags = vec!["a".to_string(), "b".to_string()];
            let value = MetadataValue::encode_json(&tags).unwrap();
            assert_eq!(value, MetadataValue::String("[\"a\",\"b\"]".to_string()));
            let back: Vec<String> = value.decode_json().unwrap();
            assert_eq!(back, tags);
        }

        #[test]
        fn test_decode_from_non_string_fails() {
            let result: Result<Vec<String>> = MetadataValue::Integer(3).decode_json();
            assert!(result.is_err());
        }

        #[test]
        fn test_sql_literals() {
            assert_eq!(MetadataValue::from("o'brien").to_sql_literal(), "'o''brien'");
            assert_eq!(MetadataValue::Integer(-4).to_sql_literal(), "-4");
            assert_eq!(MetadataValue::Float(2.0).to_sql_literal(), "2.0");
            assert_eq!(MetadataValue::Float(0.25).to_sql_literal(), "0.25");
        }
    }

    mod schema {
        use super::*;

        #[test]
        fn test_check_accepts_matching_kinds() {
            let schema = CollectionSchema::memory_records();
            let m = meta(&[
                ("kind", MetadataValue::from("curated_insight")),
                ("created_at", MetadataValue::Integer(5)),
                ("significance", MetadataValue::Integer(1)),
            ]);
            assert!(schema.check(&m).is_ok());
        }

        #[test]
        fn test_check_rejects_wrong_kind_and_unknown_key() {
            let schema = CollectionSchema::memory_records();
            let wrong = meta(&[("created_at", MetadataValue::from("yesterday"))]);
            assert!(matches!(
                schema.check(&wrong),
                Err(StrataError::Validation(_))
            ));
            let unknown = meta(&[("color", MetadataValue::from("red"))]);
            assert!(schema.check(&unknown).is_err());
            let nan = meta(&[("confidence", MetadataValue::Float(f64::NAN))]);
            assert!(schema.check(&nan).is_err());
        }

        #[test]
        fn test_invalid_field_names_rejected() {
            assert!(
                CollectionSchema::new(vec![FieldSpec::new("bad name", ScalarKind::String)])
                    .is_err()
            );
            assert!(
                CollectionSchema::new(vec![FieldSpec::new("embedding", ScalarKind::Float)])
                    .is_err()
            );
            assert!(
                CollectionSchema::new(vec![
                    FieldSpec::new("a", ScalarKind::Float),
                    FieldSpec::new("a", ScalarKind::Float),
                ])
                .is_err()
            );
        }
    }

    mod shards {
        use super::*;

        #[test]
        fn test_month_key() {
            // 2024-03-15T00:00:00Z
            let m = meta(&[("created_at", MetadataValue::Integer(1_710_460_800_000_000))]);
            let key = ShardPolicy::ByMonth("created_at".to_string())
                .shard_key(&m)
                .unwrap();
            assert_eq!(key, "2024_03");
        }

        #[test]
        fn test_field_key_is_sanitized() {
            let m = meta(&[("category", MetadataValue::from("Work Notes!"))]);
            let key = ShardPolicy::ByField("category".to_string())
                .shard_key(&m)
                .unwrap();
            assert_eq!(key, "work_notes_");
            let missing = ShardPolicy::ByField("category".to_string())
                .shard_key(&BTreeMap::new())
                .unwrap();
            assert_eq!(missing, "none");
        }

        #[test]
        fn test_manifest_incompatibility() {
            let manifest = CollectionManifest::new(
                "facts",
                8,
                "hashing-v1/8",
                CollectionSchema::memory_records(),
                ShardPolicy::None,
            );
            assert!(manifest.incompatibility(8, "hashing-v1/8").is_none());
            assert!(manifest.incompatibility(16, "hashing-v1/8").is_some());
            assert!(manifest.incompatibility(8, "other").is_some());
            assert_eq!(manifest.table_name("all"), "facts_g1_all");
        }
    }
}
