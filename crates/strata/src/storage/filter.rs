//! Metadata filters for semantic search
//!
//! Predicates are combined with AND logic. A filter is checked against the
//! collection schema before it is compiled to a SQL WHERE clause, and the
//! same predicates can be evaluated in memory against a row's metadata.

use std::collections::BTreeMap;

use crate::error::{Result, StrataError};
use crate::storage::metadata::{CollectionSchema, MetadataValue, ScalarKind, escape_sql};

/// Field holding the JSON-encoded tag list
pub const TAGS_FIELD: &str = "tags";

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value`
    Eq { field: String, value: MetadataValue },
    /// Inclusive bounds; at least one is set
    Range {
        field: String,
        min: Option<MetadataValue>,
        max: Option<MetadataValue>,
    },
    /// `field IN (values)`
    In {
        field: String,
        values: Vec<MetadataValue>,
    },
    /// Tag set contains the tag
    HasTag(String),
}

/// Filter criteria for semantic queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    predicates: Vec<Predicate>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.predicates.push(Predicate::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn range(
        mut self,
        field: impl Into<String>,
        min: Option<MetadataValue>,
        max: Option<MetadataValue>,
    ) -> Self {
        self.predicates.push(Predicate::Range {
            field: field.into(),
            min,
            max,
        });
        self
    }

    pub fn at_least(self, field: impl Into<String>, min: impl Into<MetadataValue>) -> Self {
        self.range(field, Some(min.into()), None)
    }

    pub fn at_most(self, field: impl Into<String>, max: impl Into<MetadataValue>) -> Self {
        self.range(field, None, Some(max.into()))
    }

    pub fn one_of<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<MetadataValue>,
    {
        self.predicates.push(Predicate::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn has_tag(mut self, tag: impl Into<String>) -> Self {
        self.predicates.push(Predicate::HasTag(tag.into()));
        self
    }

    /// Append every predicate of `other`
    pub fn and(mut self, other: MetadataFilter) -> Self {
        self.predicates.extend(other.predicates);
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Check field names and value kinds against `schema`
    pub fn validate(&self, schema: &CollectionSchema) -> Result<()> {
        let kind_of = |field: &str| -> Result<ScalarKind> {
            schema.field(field).map(|f| f.kind).ok_or_else(|| {
                StrataError::Validation(format!("Filter on unknown field: {field}"))
            })
        };
        let check = |field: &str, value: &MetadataValue| -> Result<()> {
            let kind = kind_of(field)?;
            let ok = match (kind, value) {
                (ScalarKind::Float, MetadataValue::Integer(_)) => true,
                (ScalarKind::Float, MetadataValue::Float(f)) => f.is_finite(),
                (kind, value) => kind == value.kind(),
            };
            if ok {
                Ok(())
            } else {
                Err(StrataError::Validation(format!(
                    "Filter value {value:?} does not match field {field} of kind {kind:?}"
                )))
            }
        };

        for predicate in &self.predicates {
            match predicate {
                Predicate::Eq { field, value } => check(field, value)?,
                Predicate::Range { field, min, max } => {
                    if kind_of(field)? == ScalarKind::String {
                        return Err(StrataError::Validation(format!(
                            "Range filter on string field: {field}"
                        )));
                    }
                    if min.is_none() && max.is_none() {
                        return Err(StrataError::Validation(format!(
                            "Range filter on {field} has no bounds"
                        )));
                    }
                    for bound in [min, max].into_iter().flatten() {
                        check(field, bound)?;
                    }
                }
                Predicate::In { field, values } => {
                    if values.is_empty() {
                        return Err(StrataError::Validation(format!(
                            "Membership filter on {field} has no values"
                        )));
                    }
                    for value in values {
                        check(field, value)?;
                    }
                }
                Predicate::HasTag(tag) => {
                    kind_of(TAGS_FIELD)?;
                    if tag.is_empty() {
                        return Err(StrataError::Validation("Empty tag filter".to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a SQL WHERE clause from this filter.
    /// Returns `None` if no predicates are set.
    ///
    /// Tag predicates compile to a LIKE prefilter; [`MetadataFilter::matches`]
    /// gives the exact answer.
    pub fn to_sql_clause(&self) -> Option<String> {
        let conditions: Vec<String> = self
            .predicates
            .iter()
            .map(|predicate| match predicate {
                Predicate::Eq { field, value } => {
                    format!("{field} = {}", value.to_sql_literal())
                }
                Predicate::Range { field, min, max } => {
                    let mut bounds = Vec::new();
                    if let Some(min) = min {
                        bounds.push(format!("{field} >= {}", min.to_sql_literal()));
                    }
                    if let Some(max) = max {
                        bounds.push(format!("{field} <= {}", max.to_sql_literal()));
                    }
                    bounds.join(" AND ")
                }
                Predicate::In { field, values } => {
                    if values.len() == 1 {
                        format!("{field} = {}", values[0].to_sql_literal())
                    } else {
                        let in_clause = values
                            .iter()
                            .map(MetadataValue::to_sql_literal)
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("{field} IN ({in_clause})")
                    }
                }
                Predicate::HasTag(tag) => {
                    let encoded = serde_json::to_string(tag).unwrap_or_default();
                    format!("{TAGS_FIELD} LIKE '%{}%'", escape_sql(&encoded))
                }
            })
            .collect();

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }

    /// Evaluate the filter against one row's metadata
    pub fn matches(&self, metadata: &BTreeMap<String, MetadataValue>) -> bool {
        self.predicates.iter().all(|predicate| match predicate {
            Predicate::Eq { field, value } => metadata
                .get(field)
                .is_some_and(|actual| values_equal(actual, value)),
            Predicate::Range { field, min, max } => {
                let Some(actual) = metadata.get(field).and_then(MetadataValue::as_f64) else {
                    return false;
                };
                let above = min
                    .as_ref()
                    .and_then(MetadataValue::as_f64)
                    .is_none_or(|min| actual >= min);
                let below = max
                    .as_ref()
                    .and_then(MetadataValue::as_f64)
                    .is_none_or(|max| actual <= max);
                above && below
            }
            Predicate::In { field, values } => metadata
                .get(field)
                .is_some_and(|actual| values.iter().any(|v| values_equal(actual, v))),
            Predicate::HasTag(tag) => metadata
                .get(TAGS_FIELD)
                .and_then(|v| v.decode_json::<Vec<String>>().ok())
                .is_some_and(|tags| tags.iter().any(|t| t == tag)),
        })
    }
}

fn values_equal(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a, b) {
        (MetadataValue::String(x), MetadataValue::String(y)) => x == y,
        (MetadataValue::Integer(x), MetadataValue::Integer(y)) => x == y,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> BTreeMap<String, MetadataValue> {
        let mut m = BTreeMap::new();
        m.insert("kind".to_string(), MetadataValue::from("extracted_fact"));
        m.insert("significance".to_string(), MetadataValue::Float(0.7));
        m.insert("created_at".to_string(), MetadataValue::Integer(100));
        m.insert(
            "tags".to_string(),
            MetadataValue::encode_json(&["rust", "db_tools"]).unwrap(),
        );
        m
    }

    #[test]
    fn test_empty_filter() {
        let filter = MetadataFilter::new();
        assert!(filter.is_empty());
        assert!(filter.to_sql_clause().is_none());
        assert!(filter.matches(&row()));
    }

    #[test]
    fn test_eq_filter() {
        let filter = MetadataFilter::new().eq("kind", "extracted_fact");
        assert_eq!(filter.to_sql_clause().unwrap(), "kind = 'extracted_fact'");
        assert!(filter.matches(&row()));
        assert!(!MetadataFilter::new().eq("kind", "other").matches(&row()));
    }

    #[test]
    fn test_string_values_are_escaped() {
        let filter = MetadataFilter::new().eq("subject", "o'brien");
        assert_eq!(filter.to_sql_clause().unwrap(), "subject = 'o''brien'");
    }

    #[test]
    fn test_range_filter() {
        let filter = MetadataFilter::new().range(
            "significance",
            Some(MetadataValue::Float(0.5)),
            Some(MetadataValue::Float(0.9)),
        );
        assert_eq!(
            filter.to_sql_clause().unwrap(),
            "significance >= 0.5 AND significance <= 0.9"
        );
        assert!(filter.matches(&row()));
        assert!(
            !MetadataFilter::new()
                .at_least("significance", 0.8)
                .matches(&row())
        );
    }

    #[test]
    fn test_membership_filter() {
        let filter = MetadataFilter::new().one_of("kind", ["curated_insight", "extracted_fact"]);
        assert_eq!(
            filter.to_sql_clause().unwrap(),
            "kind IN ('curated_insight', 'extracted_fact')"
        );
        assert!(filter.matches(&row()));
        let single = MetadataFilter::new().one_of("kind", ["curated_insight"]);
        assert_eq!(single.to_sql_clause().unwrap(), "kind = 'curated_insight'");
        assert!(!single.matches(&row()));
    }

    #[test]
    fn test_tag_filter_is_exact_in_memory() {
        let filter = MetadataFilter::new().has_tag("db_tools");
        assert_eq!(
            filter.to_sql_clause().unwrap(),
            "tags LIKE '%\"db_tools\"%'"
        );
        assert!(filter.matches(&row()));
        assert!(!MetadataFilter::new().has_tag("dbxtools").matches(&row()));
        assert!(!MetadataFilter::new().has_tag("rus").matches(&row()));
    }

    #[test]
    fn test_missing_field_never_matches() {
        assert!(!MetadataFilter::new().eq("subject", "x").matches(&row()));
    }

    #[test]
    fn test_combined_filters() {
        let filter = MetadataFilter::new()
            .eq("kind", "extracted_fact")
            .at_least("created_at", 50i64)
            .has_tag("rust");
        let sql = filter.to_sql_clause().unwrap();
        assert!(sql.contains("kind = 'extracted_fact'"));
        assert!(sql.contains("created_at >= 50"));
        assert!(sql.contains(" AND "));
        assert!(filter.matches(&row()));
    }

    mod validation {
        use super::*;

        #[test]
        fn test_valid_filter_passes() {
            let schema = CollectionSchema::memory_records();
            let filter = MetadataFilter::new()
                .eq("kind", "extracted_fact")
                .at_least("significance", 1i64)
                .has_tag("x");
            assert!(filter.validate(&schema).is_ok());
        }

        #[test]
        fn test_unknown_field_rejected() {
            let schema = CollectionSchema::memory_records();
            let filter = MetadataFilter::new().eq("colour", "red");
            assert!(matches!(
                filter.validate(&schema),
                Err(StrataError::Validation(_))
            ));
        }

        #[test]
        fn test_kind_mismatch_rejected() {
            let schema = CollectionSchema::memory_records();
            assert!(
                MetadataFilter::new()
                    .eq("created_at", "today")
                    .validate(&schema)
                    .is_err()
            );
            assert!(
                MetadataFilter::new()
                    .at_least("kind", "a")
                    .validate(&schema)
                    .is_err()
            );
            assert!(
                MetadataFilter::new()
                    .one_of("kind", Vec::<&str>::new())
                    .validate(&schema)
                    .is_err()
            );
        }
    }
}
