//! Query execution
//!
//! Runs the plan chosen by the router. Every tier call carries the configured
//! budget; a hybrid query keeps whatever the responding tiers returned and
//! reports the rest in `failed_tiers`. Dropping the returned future cancels
//! every in-flight tier call, including an archive scan running on the
//! blocking pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::hashing::tokenize;
use crate::engine::{Engine, blocking, unseal_entry};
use crate::error::{Result, StrataError};
use crate::memory::types::{ArchivedEntry, BUILTIN_COLLECTIONS, MemoryRecord};
use crate::router::{MAX_QUERY_RESULTS, QueryRequest, QueryRoute, Tier};
use crate::storage::fast::FastHit;
use crate::storage::filter::MetadataFilter;
use crate::storage::semantic::SemanticEntry;

/// A tier that did not contribute to a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierFailure {
    pub tier: Tier,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: Uuid,
    /// Tier that produced the hit
    pub tier: Tier,
    pub collection: Option<String>,
    pub similarity: f32,
    pub effective_score: f64,
    /// `similarity * similarity_weight + effective_score * rerank_weight`
    pub final_score: f64,
    /// Semantic record, or the private reference of an archive hit.
    /// `None` when a fast hit could not be hydrated.
    pub record: Option<MemoryRecord>,
    /// Unsealed content of an archive hit
    pub archived: Option<ArchivedEntry>,
}

impl QueryHit {
    pub fn content(&self) -> Option<&str> {
        match (&self.archived, &self.record) {
            (Some(entry), _) => Some(&entry.content),
            (None, Some(record)) => record.content(),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub route: QueryRoute,
    pub hits: Vec<QueryHit>,
    /// Tiers that were offline, timed out or failed
    pub failed_tiers: Vec<TierFailure>,
}

impl QueryResponse {
    pub fn is_partial(&self) -> bool {
        !self.failed_tiers.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.hits.iter().map(|h| h.id).collect()
    }
}

/// Result of one tier before ranking
struct Candidate {
    id: String,
    tier: Tier,
    collection: String,
    similarity: f32,
    record: Option<MemoryRecord>,
}

/// Sets the flag when the owning query future is dropped
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Engine {
    /// Answer a query along the route the router picks for it
    pub async fn query(&self, mut request: QueryRequest) -> Result<QueryResponse> {
        request.k = request.k.min(MAX_QUERY_RESULTS);
        let plan = self.router.plan_query(&request)?;
        let mut failed: Vec<TierFailure> = plan
            .skipped
            .iter()
            .map(|tier| TierFailure {
                tier: *tier,
                reason: "tier is offline".to_string(),
            })
            .collect();

        if request.k == 0 {
            return Ok(QueryResponse {
                route: plan.route,
                hits: Vec::new(),
                failed_tiers: failed,
            });
        }

        if plan.route == QueryRoute::Archive {
            let hits = self
                .timed(Tier::Archive, self.private_search(&request))
                .await?;
            return Ok(QueryResponse {
                route: plan.route,
                hits,
                failed_tiers: failed,
            });
        }

        let collections = self.target_collections(&request)?;
        let embedding = if request.text.trim().is_empty() {
            None
        } else {
            Some(self.embed(&request.text).await?)
        };
        let depth = request
            .k
            .saturating_mul(self.config.router.hybrid_candidate_multiplier.max(1));

        let candidates = match (plan.route, embedding.as_deref()) {
            (QueryRoute::Semantic, embedding) => {
                self.timed(
                    Tier::Semantic,
                    self.semantic_search(&collections, embedding, request.filter.as_ref(), depth),
                )
                .await?
            }
            (QueryRoute::Fast, Some(embedding)) if plan.uses(Tier::Fast) => {
                let hits = self
                    .timed(Tier::Fast, self.fast_search(embedding, depth, &collections))
                    .await?;
                self.hydrate(hits, Vec::new()).await
            }
            (QueryRoute::Fast, Some(embedding)) => {
                self.timed(
                    Tier::Semantic,
                    self.semantic_search(&collections, Some(embedding), None, depth),
                )
                .await?
            }
            (QueryRoute::Hybrid, Some(embedding)) => {
                let fast = async {
                    if plan.uses(Tier::Fast) {
                        Some(
                            self.timed(Tier::Fast, self.fast_search(embedding, depth, &collections))
                                .await,
                        )
                    } else {
                        None
                    }
                };
                let semantic = async {
                    if plan.uses(Tier::Semantic) {
                        Some(
                            self.timed(
                                Tier::Semantic,
                                self.semantic_search(&collections, Some(embedding), None, depth),
                            )
                            .await,
                        )
                    } else {
                        None
                    }
                };
                let (fast, semantic) = tokio::join!(fast, semantic);
                self.merge_hybrid(fast, semantic, &mut failed).await?
            }
            (_, None) => {
                return Err(StrataError::Validation(
                    "Vector queries need query text".to_string(),
                ));
            }
            (QueryRoute::Archive, Some(_)) => {
                return Err(StrataError::Validation(
                    "Archive queries are served by the private path".to_string(),
                ));
            }
        };

        let hits = self.rank(candidates, &request);
        debug!(
            route = ?plan.route,
            hits = hits.len(),
            failed = failed.len(),
            "Query answered"
        );
        Ok(QueryResponse {
            route: plan.route,
            hits,
            failed_tiers: failed,
        })
    }

    /// Run `work` against `tier` within the per-tier budget
    async fn timed<T>(&self, tier: Tier, work: impl Future<Output = Result<T>>) -> Result<T> {
        let budget = self.config.router.tier_timeout();
        let delay = self.latency.get(&tier).map(|d| *d);
        let work = async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            work.await
        };
        match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => {
                let budget_ms = self.config.router.tier_timeout_ms;
                warn!(%tier, budget_ms, "Tier query timed out");
                Err(StrataError::QueryTimeout {
                    tier: tier.as_str().to_string(),
                    budget_ms,
                })
            }
        }
    }

    fn target_collections(&self, request: &QueryRequest) -> Result<Vec<String>> {
        if request.collections.is_empty() {
            return Ok(BUILTIN_COLLECTIONS.iter().map(|c| c.to_string()).collect());
        }
        let known = self.semantic.collection_names();
        for name in &request.collections {
            if !known.contains(name) {
                return Err(StrataError::NotFound(format!("collection {name}")));
            }
        }
        Ok(request.collections.clone())
    }

    async fn fast_search(
        &self,
        embedding: &[f32],
        depth: usize,
        collections: &[String],
    ) -> Result<Vec<FastHit>> {
        let Some(index) = self.fast_index().cloned() else {
            return Err(StrataError::tier_unavailable("fast", "fast index is disabled"));
        };
        let embedding = embedding.to_vec();
        let hits = blocking(move || index.query(&embedding, depth)).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| collections.contains(&hit.collection))
            .collect())
    }

    async fn semantic_search(
        &self,
        collections: &[String],
        embedding: Option<&[f32]>,
        filter: Option<&MetadataFilter>,
        depth: usize,
    ) -> Result<Vec<Candidate>> {
        let searches = collections.iter().map(|collection| async move {
            let rows: Vec<(SemanticEntry, f32)> = match embedding {
                Some(embedding) => self
                    .semantic
                    .query(collection, embedding, filter, depth)
                    .await?
                    .into_iter()
                    .map(|hit| (hit.entry, hit.similarity))
                    .collect(),
                // Filter-only query: every match, ranked by score alone
                None => self
                    .semantic
                    .scan(collection, filter)
                    .await?
                    .into_iter()
                    .map(|entry| (entry, 0.0))
                    .collect(),
            };
            Ok::<_, StrataError>(rows)
        });

        let mut candidates = Vec::new();
        for result in join_all(searches).await {
            for (entry, similarity) in result? {
                candidates.push(to_candidate(entry, similarity, Tier::Semantic));
            }
        }
        Ok(candidates)
    }

    /// Attach semantic records to fast hits not already covered by `known`
    async fn hydrate(&self, hits: Vec<FastHit>, known: Vec<Candidate>) -> Vec<Candidate> {
        let mut candidates = known;
        let seen: HashSet<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let missing: Vec<FastHit> = hits.into_iter().filter(|h| !seen.contains(&h.record_id)).collect();
        if missing.is_empty() {
            return candidates;
        }

        let mut records: HashMap<String, MemoryRecord> = HashMap::new();
        if self.router.is_available(Tier::Semantic) {
            let mut by_collection: BTreeMap<&str, Vec<String>> = BTreeMap::new();
            for hit in &missing {
                by_collection
                    .entry(hit.collection.as_str())
                    .or_default()
                    .push(hit.record_id.clone());
            }
            for (collection, ids) in by_collection {
                match self.semantic.get_many(collection, &ids).await {
                    Ok(entries) => {
                        for entry in entries {
                            if let Some(record) = entry_to_record(&entry) {
                                records.insert(entry.id, record);
                            }
                        }
                    }
                    Err(e) => warn!(collection, error = %e, "Failed to hydrate fast hits"),
                }
            }
        }

        for hit in missing {
            let record = records.remove(&hit.record_id);
            // Purged since the last mirror batch
            if record.is_none() && self.router.is_available(Tier::Semantic) {
                continue;
            }
            candidates.push(Candidate {
                id: hit.record_id,
                tier: Tier::Fast,
                collection: hit.collection,
                similarity: hit.similarity,
                record,
            });
        }
        candidates
    }

    async fn merge_hybrid(
        &self,
        fast: Option<Result<Vec<FastHit>>>,
        semantic: Option<Result<Vec<Candidate>>>,
        failed: &mut Vec<TierFailure>,
    ) -> Result<Vec<Candidate>> {
        let mut first_error = None;
        let fast = match fast {
            Some(Ok(hits)) => Some(hits),
            Some(Err(e)) => {
                failed.push(TierFailure {
                    tier: Tier::Fast,
                    reason: e.to_string(),
                });
                first_error = Some(e);
                None
            }
            None => None,
        };
        let semantic = match semantic {
            Some(Ok(candidates)) => Some(candidates),
            Some(Err(e)) => {
                failed.push(TierFailure {
                    tier: Tier::Semantic,
                    reason: e.to_string(),
                });
                first_error = first_error.or(Some(e));
                None
            }
            None => None,
        };

        match (fast, semantic) {
            (Some(hits), Some(candidates)) => Ok(self.hydrate(hits, candidates).await),
            (None, Some(candidates)) => Ok(candidates),
            (Some(hits), None) => Ok(hits
                .into_iter()
                .map(|hit| Candidate {
                    id: hit.record_id,
                    tier: Tier::Fast,
                    collection: hit.collection,
                    similarity: hit.similarity,
                    record: None,
                })
                .collect()),
            (None, None) => Err(first_error.unwrap_or_else(|| {
                StrataError::tier_unavailable("fast+semantic", "no vector tier answered")
            })),
        }
    }

    /// Drop superseded and faded records, blend scores, keep the top k
    fn rank(&self, candidates: Vec<Candidate>, request: &QueryRequest) -> Vec<QueryHit> {
        let now = Utc::now();
        let ranking = &self.config.scoring.ranking;
        let mut seen = HashSet::new();
        let mut hits = Vec::new();

        for candidate in candidates {
            if !seen.insert(candidate.id.clone()) {
                continue;
            }
            let Ok(id) = Uuid::parse_str(&candidate.id) else {
                warn!(id = %candidate.id, "Skipping hit with a malformed id");
                continue;
            };
            let effective = match &candidate.record {
                Some(record) => {
                    if record.superseded_by.is_some() && !request.include_superseded {
                        continue;
                    }
                    let effective = self.scorer.effective(&record.score, record.created_at, now);
                    if !request.include_faded && !self.scorer.is_above_floor(effective) {
                        continue;
                    }
                    effective
                }
                None => 0.0,
            };
            hits.push(QueryHit {
                id,
                tier: candidate.tier,
                collection: Some(candidate.collection),
                similarity: candidate.similarity,
                effective_score: effective,
                final_score: blend(
                    candidate.similarity,
                    effective,
                    ranking.similarity_weight,
                    ranking.rerank_weight,
                ),
                record: candidate.record,
                archived: None,
            });
        }

        sort_and_truncate(&mut hits, request.k);
        hits
    }

    /// Scan sealed frames in the requested window, unsealing each through the
    /// vault and matching it against the query terms
    async fn private_search(&self, request: &QueryRequest) -> Result<Vec<QueryHit>> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancelled));

        let vault = Arc::clone(&self.vault);
        let archive = self.archive.clone();
        let terms: HashSet<String> = tokenize(&request.text).into_iter().collect();
        let filter = request.filter.clone();
        let window = request.time_range;

        let matches = blocking(move || {
            let cursor = match window {
                Some((start, end)) => archive.read_range(start, end),
                None => archive.iter_all(),
            };
            let mut matches = Vec::new();
            for frame in cursor {
                if cancelled.load(Ordering::Relaxed) {
                    debug!("Private query abandoned; stopping archive scan");
                    break;
                }
                let frame = frame?;
                if !frame.is_sealed() {
                    continue;
                }
                let entry = match unseal_entry(&vault, &frame.payload) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(frame_id = %frame.id, error = %e, "Skipping private frame");
                        continue;
                    }
                };
                if let Some(filter) = &filter {
                    if !filter.matches(&entry.metadata()?) {
                        continue;
                    }
                }
                let similarity = term_overlap(&terms, &entry);
                if !terms.is_empty() && similarity <= 0.0 {
                    continue;
                }
                let capsule_id = frame
                    .capsule_id
                    .clone()
                    .unwrap_or_else(|| entry.record_id.to_string());
                matches.push((frame.id, capsule_id, entry, similarity));
            }
            Ok(matches)
        })
        .await?;

        let now = Utc::now();
        let ranking = &self.config.scoring.ranking;
        let mut hits = Vec::new();
        for (frame_id, capsule_id, entry, similarity) in matches {
            let effective = self.scorer.effective(&entry.score, entry.created_at, now);
            if !request.include_faded && !self.scorer.is_above_floor(effective) {
                continue;
            }
            hits.push(QueryHit {
                id: entry.record_id,
                tier: Tier::Archive,
                collection: None,
                similarity,
                effective_score: effective,
                final_score: blend(
                    similarity,
                    effective,
                    ranking.similarity_weight,
                    ranking.rerank_weight,
                ),
                record: Some(entry.reference(&frame_id, &capsule_id)),
                archived: Some(entry),
            });
        }
        sort_and_truncate(&mut hits, request.k);
        Ok(hits)
    }
}

fn to_candidate(entry: SemanticEntry, similarity: f32, tier: Tier) -> Candidate {
    let record = entry_to_record(&entry);
    Candidate {
        id: entry.id,
        tier,
        collection: entry.collection,
        similarity,
        record,
    }
}

fn entry_to_record(entry: &SemanticEntry) -> Option<MemoryRecord> {
    let id = Uuid::parse_str(&entry.id).ok()?;
    match MemoryRecord::from_metadata(id, entry.embedding.clone(), &entry.metadata) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(id = %entry.id, error = %e, "Failed to decode stored record");
            None
        }
    }
}

fn blend(similarity: f32, effective: f64, similarity_weight: f32, rerank_weight: f32) -> f64 {
    f64::from(similarity) * f64::from(similarity_weight) + effective * f64::from(rerank_weight)
}

fn sort_and_truncate(hits: &mut Vec<QueryHit>, k: usize) {
    hits.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
}

/// Share of distinct query terms present in the entry's content, label or tags
fn term_overlap(terms: &HashSet<String>, entry: &ArchivedEntry) -> f32 {
    if terms.is_empty() {
        return 1.0;
    }
    let mut words: HashSet<String> = tokenize(&entry.content).into_iter().collect();
    if let Some(label) = &entry.label {
        words.extend(tokenize(label));
    }
    for tag in &entry.tags {
        words.extend(tokenize(tag));
    }
    let present = terms.iter().filter(|t| words.contains(*t)).count();
    present as f32 / terms.len() as f32
}
