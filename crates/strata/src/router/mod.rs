//! Storage router
//!
//! Decides which tier a write lands in and which tiers serve a query. Both
//! decisions fail closed: ambiguous writes are handled as private, private
//! queries only ever reach the archive, and a missing tier yields
//! `TierUnavailable` instead of a fallback to a less restrictive tier.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AmbiguousPolicy, RouterConfig};
use crate::error::{Result, StrataError};
use crate::memory::types::{Classification, ContentKind, Sensitivity};
use crate::storage::filter::MetadataFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Archive,
    Semantic,
    Fast,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Archive, Tier::Semantic, Tier::Fast];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Archive => "archive",
            Tier::Semantic => "semantic",
            Tier::Fast => "fast",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a write goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRoute {
    /// Sealed archive frame plus a private reference; nothing is embedded
    Private,
    /// Embedded record in the semantic tier, optionally copied to the archive
    Semantic { kind: ContentKind, archive_backup: bool },
    /// Unsealed archive frame only
    Raw { kind: ContentKind },
}

impl WriteRoute {
    /// Tiers that must accept the write for it to succeed
    pub fn required_tiers(&self) -> Vec<Tier> {
        match self {
            WriteRoute::Private | WriteRoute::Raw { .. } => vec![Tier::Archive],
            WriteRoute::Semantic {
                archive_backup: true,
                ..
            } => vec![Tier::Semantic, Tier::Archive],
            WriteRoute::Semantic { .. } => vec![Tier::Semantic],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryScope {
    #[default]
    Standard,
    /// Only sealed archive content, served through the vault
    Private,
}

/// Largest `k` a query is answered with; bigger limits are clamped
pub const MAX_QUERY_RESULTS: usize = 10_000;

/// A retrieval request
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub filter: Option<MetadataFilter>,
    /// Semantic collections to search; empty means every built-in collection
    pub collections: Vec<String>,
    pub k: usize,
    pub scope: QueryScope,
    /// Inclusive time window, applied to archive reads
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub include_superseded: bool,
    /// Keep results whose decayed score fell below the floor
    pub include_faded: bool,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filter: None,
            collections: Vec::new(),
            k: 10,
            scope: QueryScope::Standard,
            time_range: None,
            include_superseded: false,
            include_faded: false,
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    pub fn limit(mut self, k: usize) -> Self {
        self.k = k.min(MAX_QUERY_RESULTS);
        self
    }

    pub fn private(mut self) -> Self {
        self.scope = QueryScope::Private;
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some((start, end));
        self
    }

    pub fn include_superseded(mut self) -> Self {
        self.include_superseded = true;
        self
    }

    pub fn include_faded(mut self) -> Self {
        self.include_faded = true;
        self
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    fn has_filter(&self) -> bool {
        self.filter.as_ref().is_some_and(|f| !f.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryRoute {
    Fast,
    Semantic,
    /// Fast candidates re-ranked against the semantic tier
    Hybrid,
    Archive,
}

/// A query route resolved against tier availability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub route: QueryRoute,
    /// Tiers to query, in order
    pub tiers: Vec<Tier>,
    /// Tiers the route wanted but that are unavailable
    pub skipped: Vec<Tier>,
}

impl QueryPlan {
    pub fn is_degraded(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn uses(&self, tier: Tier) -> bool {
        self.tiers.contains(&tier)
    }
}

#[derive(Debug)]
struct Availability {
    archive: AtomicBool,
    semantic: AtomicBool,
    fast: AtomicBool,
}

impl Availability {
    fn flag(&self, tier: Tier) -> &AtomicBool {
        match tier {
            Tier::Archive => &self.archive,
            Tier::Semantic => &self.semantic,
            Tier::Fast => &self.fast,
        }
    }
}

pub struct Router {
    config: RouterConfig,
    available: Availability,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            available: Availability {
                archive: AtomicBool::new(true),
                semantic: AtomicBool::new(true),
                fast: AtomicBool::new(true),
            },
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_available(&self, tier: Tier) -> bool {
        self.available.flag(tier).load(Ordering::SeqCst)
    }

    pub fn set_available(&self, tier: Tier, available: bool) {
        let previous = self.available.flag(tier).swap(available, Ordering::SeqCst);
        if previous != available {
            if available {
                debug!(%tier, "Tier marked available");
            } else {
                warn!(%tier, "Tier marked unavailable");
            }
        }
    }

    /// `TierUnavailable` unless `tier` is online
    pub fn require(&self, tier: Tier) -> Result<()> {
        if self.is_available(tier) {
            Ok(())
        } else {
            Err(StrataError::tier_unavailable(tier.as_str(), "tier is offline"))
        }
    }

    /// Route a write from its sensitivity flag, falling back to its kind tag
    pub fn classify_write(&self, classification: &Classification) -> Result<WriteRoute> {
        let kind = classification.kind.as_deref().map(ContentKind::from_tag);

        let resolved = match (classification.sensitivity, kind) {
            (Some(Sensitivity::Private), _) => Some(ContentKind::Private),
            (_, Some(Some(kind))) => {
                if classification.sensitivity == Some(Sensitivity::Standard)
                    && kind == ContentKind::Private
                {
                    // Conflicting markers
                    None
                } else {
                    Some(kind)
                }
            }
            _ => None,
        };

        let kind = match resolved {
            Some(kind) => kind,
            None => {
                let tag = classification.kind.as_deref().unwrap_or("<none>");
                match self.config.ambiguous_policy {
                    AmbiguousPolicy::Reject => {
                        return Err(StrataError::ClassificationAmbiguous(format!(
                            "cannot route content tagged {tag}"
                        )));
                    }
                    AmbiguousPolicy::Restrict => {
                        warn!(tag, "Ambiguous classification; storing as private");
                        ContentKind::Private
                    }
                }
            }
        };

        Ok(match kind {
            ContentKind::Private => WriteRoute::Private,
            ContentKind::Insight | ContentKind::Fact | ContentKind::Flexible => {
                WriteRoute::Semantic {
                    kind,
                    archive_backup: self.config.archive_backup,
                }
            }
            ContentKind::Dialogue | ContentKind::Snapshot => WriteRoute::Raw { kind },
        })
    }

    /// Classify, then check every required tier is up before anything is written
    pub fn plan_write(&self, classification: &Classification) -> Result<WriteRoute> {
        let route = self.classify_write(classification)?;
        for tier in route.required_tiers() {
            self.require(tier)?;
        }
        Ok(route)
    }

    /// Route a query by scope, filter and length, ignoring availability
    pub fn classify_query(&self, request: &QueryRequest) -> Result<QueryRoute> {
        if request.scope == QueryScope::Private {
            return Ok(QueryRoute::Archive);
        }
        if request.has_filter() {
            return Ok(QueryRoute::Semantic);
        }
        match request.word_count() {
            0 => Err(StrataError::Validation(
                "Query needs text or a metadata filter".to_string(),
            )),
            n if n <= self.config.short_query_max_words => Ok(QueryRoute::Fast),
            _ => Ok(QueryRoute::Hybrid),
        }
    }

    /// Resolve the route against tier availability.
    ///
    /// Standard queries may drop between the fast and semantic tiers and report
    /// the skipped tier. Private and filtered queries have a single safe tier and
    /// fail when it is down.
    pub fn plan_query(&self, request: &QueryRequest) -> Result<QueryPlan> {
        let route = self.classify_query(request)?;
        let plan = match route {
            QueryRoute::Archive => {
                self.require(Tier::Archive)?;
                QueryPlan {
                    route,
                    tiers: vec![Tier::Archive],
                    skipped: Vec::new(),
                }
            }
            QueryRoute::Semantic => {
                self.require(Tier::Semantic)?;
                QueryPlan {
                    route,
                    tiers: vec![Tier::Semantic],
                    skipped: Vec::new(),
                }
            }
            QueryRoute::Fast | QueryRoute::Hybrid => {
                let wanted: &[Tier] = match route {
                    QueryRoute::Fast => &[Tier::Fast],
                    _ => &[Tier::Fast, Tier::Semantic],
                };
                let mut tiers: Vec<Tier> = wanted
                    .iter()
                    .copied()
                    .filter(|t| self.is_available(*t))
                    .collect();
                let skipped: Vec<Tier> = wanted
                    .iter()
                    .copied()
                    .filter(|t| !self.is_available(*t))
                    .collect();
                if tiers.is_empty() && route == QueryRoute::Fast {
                    self.require(Tier::Semantic)?;
                    tiers.push(Tier::Semantic);
                }
                if tiers.is_empty() {
                    return Err(StrataError::tier_unavailable(
                        "fast+semantic",
                        "no vector tier is online",
                    ));
                }
                QueryPlan {
                    route,
                    tiers,
                    skipped,
                }
            }
        };
        debug!(route = ?plan.route, tiers = ?plan.tiers, skipped = ?plan.skipped, "Planned query");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(RouterConfig::default())
    }

    mod writes {
        use super::*;

        #[test]
        fn test_private_flag_wins() {
            let router = router();
            let c = Classification::kind(ContentKind::Insight).with_sensitivity(Sensitivity::Private);
            assert_eq!(router.classify_write(&c).unwrap(), WriteRoute::Private);
            assert_eq!(
                router.classify_write(&Classification::private()).unwrap(),
                WriteRoute::Private
            );
        }

        #[test]
        fn test_kind_routing() {
            let router = router();
            assert_eq!(
                router
                    .classify_write(&Classification::kind(ContentKind::Fact))
                    .unwrap(),
                WriteRoute::Semantic {
                    kind: ContentKind::Fact,
                    archive_backup: false
                }
            );
            assert_eq!(
                router
                    .classify_write(&Classification::kind(ContentKind::Dialogue))
                    .unwrap(),
                WriteRoute::Raw {
                    kind: ContentKind::Dialogue
                }
            );
            assert_eq!(
                router
                    .classify_write(&Classification::tagged("snapshot"))
                    .unwrap(),
                WriteRoute::Raw {
                    kind: ContentKind::Snapshot
                }
            );
        }

        #[test]
        fn test_archive_backup_from_config() {
            let router = Router::new(RouterConfig {
                archive_backup: true,
                ..RouterConfig::default()
            });
            let route = router
                .classify_write(&Classification::kind(ContentKind::Insight))
                .unwrap();
            assert_eq!(route.required_tiers(), vec![Tier::Semantic, Tier::Archive]);
        }

        #[test]
        fn test_ambiguous_defaults_to_private() {
            let router = router();
            assert_eq!(
                router.classify_write(&Classification::default()).unwrap(),
                WriteRoute::Private
            );
            assert_eq!(
                router
                    .classify_write(&Classification::tagged("mystery"))
                    .unwrap(),
                WriteRoute::Private
            );
            let conflicting = Classification::kind(ContentKind::Private)
                .with_sensitivity(Sensitivity::Standard);
            assert_eq!(router.classify_write(&conflicting).unwrap(), WriteRoute::Private);
        }

        #[test]
        fn test_ambiguous_rejected_under_reject_policy() {
            let router = Router::new(RouterConfig {
                ambiguous_policy: AmbiguousPolicy::Reject,
                ..RouterConfig::default()
            });
            assert!(matches!(
                router.classify_write(&Classification::tagged("mystery")),
                Err(StrataError::ClassificationAmbiguous(_))
            ));
            // An explicit private flag is never ambiguous
            assert_eq!(
                router.classify_write(&Classification::private()).unwrap(),
                WriteRoute::Private
            );
        }

        #[test]
        fn test_plan_write_fails_closed() {
            let router = router();
            router.set_available(Tier::Archive, false);
            assert!(matches!(
                router.plan_write(&Classification::private()),
                Err(StrataError::TierUnavailable { .. })
            ));
            // Semantic writes do not need the archive without backup
            assert!(
                router
                    .plan_write(&Classification::kind(ContentKind::Insight))
                    .is_ok()
            );
        }
    }

    mod queries {
        use super::*;

        #[test]
        fn test_short_query_goes_fast() {
            let router = router();
            let request = QueryRequest::new("rust lifetimes");
            assert_eq!(router.classify_query(&request).unwrap(), QueryRoute::Fast);
        }

        #[test]
        fn test_limit_is_clamped() {
            assert_eq!(QueryRequest::new("x").limit(usize::MAX).k, MAX_QUERY_RESULTS);
            assert_eq!(QueryRequest::new("x").limit(3).k, 3);
        }

        #[test]
        fn test_long_query_goes_hybrid() {
            let router = router();
            let request = QueryRequest::new("what did we decide about the database schema last week");
            assert_eq!(router.classify_query(&request).unwrap(), QueryRoute::Hybrid);
        }

        #[test]
        fn test_filter_goes_semantic() {
            let router = router();
            let request = QueryRequest::new("rust").with_filter(MetadataFilter::new().has_tag("work"));
            assert_eq!(router.classify_query(&request).unwrap(), QueryRoute::Semantic);

            let filter_only = QueryRequest::new("").with_filter(MetadataFilter::new().has_tag("work"));
            assert_eq!(router.classify_query(&filter_only).unwrap(), QueryRoute::Semantic);
        }

        #[test]
        fn test_private_scope_goes_archive() {
            let router = router();
            let request = QueryRequest::new("anything at all")
                .with_filter(MetadataFilter::new().has_tag("work"))
                .private();
            assert_eq!(router.classify_query(&request).unwrap(), QueryRoute::Archive);
        }

        #[test]
        fn test_empty_query_rejected() {
            let router = router();
            assert!(matches!(
                router.classify_query(&QueryRequest::new("   ")),
                Err(StrataError::Validation(_))
            ));
        }

        #[test]
        fn test_private_query_never_falls_back() {
            let router = router();
            router.set_available(Tier::Archive, false);
            let err = router
                .plan_query(&QueryRequest::new("diary").private())
                .unwrap_err();
            assert!(matches!(err, StrataError::TierUnavailable { ref tier, .. } if tier == "archive"));
        }

        #[test]
        fn test_fast_degrades_to_semantic() {
            let router = router();
            router.set_available(Tier::Fast, false);
            let plan = router.plan_query(&QueryRequest::new("rust")).unwrap();
            assert_eq!(plan.route, QueryRoute::Fast);
            assert_eq!(plan.tiers, vec![Tier::Semantic]);
            assert_eq!(plan.skipped, vec![Tier::Fast]);
            assert!(plan.is_degraded());
        }

        #[test]
        fn test_hybrid_partial_availability() {
            let router = router();
            router.set_available(Tier::Semantic, false);
            let plan = router
                .plan_query(&QueryRequest::new("tell me everything about the release plan"))
                .unwrap();
            assert_eq!(plan.tiers, vec![Tier::Fast]);
            assert_eq!(plan.skipped, vec![Tier::Semantic]);

            router.set_available(Tier::Fast, false);
            assert!(matches!(
                router.plan_query(&QueryRequest::new("tell me everything about the release plan")),
                Err(StrataError::TierUnavailable { .. })
            ));
        }

        #[test]
        fn test_filtered_query_requires_semantic() {
            let router = router();
            router.set_available(Tier::Semantic, false);
            let request = QueryRequest::new("rust").with_filter(MetadataFilter::new().has_tag("work"));
            assert!(matches!(
                router.plan_query(&request),
                Err(StrataError::TierUnavailable { .. })
            ));
        }
    }
}
