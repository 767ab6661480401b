//! Engine facade
//!
//! Owns the router, the vault, the scorer and the three tiers, and exposes the
//! operations callers use: write, query, recall, decrypt, purge, rescore and
//! maintenance. Private plaintext only ever travels between the vault and the
//! archive; it is never embedded, mirrored or logged.

mod query;
mod rescore;
mod status;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::archive::{ArchiveFrame, ArchiveStore, NewFrame};
use crate::config::Config;
use crate::embedding::{EmbeddingProvider, provider_from_config};
use crate::error::{Result, StrataError};
use crate::memory::significance::{DecayTier, Scorer, SignalValues, SignificanceScore};
use crate::memory::signals::SignalExtractor;
use crate::memory::types::{
    ArchivedEntry, BUILTIN_COLLECTIONS, Classification, ContentKind, MemoryRecord, Recalled,
    RecordKind, WriteItem,
};
use crate::router::{Router, Tier, WriteRoute};
use crate::storage::fast::{FastEntry, FastIndex};
use crate::storage::metadata::{CollectionSchema, MetadataValue, ShardPolicy};
use crate::storage::semantic::SemanticStore;
use crate::storage::sync::SyncHandle;
use crate::vault::Vault;

pub use query::{QueryHit, QueryResponse, TierFailure};
pub use rescore::RescoreReport;
pub use status::{EngineStatus, FastStatus, ScorerStatus, TierStatus, VaultStatus};

/// User rating assumed when a write carries none
const NEUTRAL_RATING: f64 = 0.5;

/// Record type of flexible records written without one
const DEFAULT_RECORD_TYPE: &str = "note";

/// Metadata field re-embedded by collection migrations
const CONTENT_FIELD: &str = "content";

/// Where a write ended up
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub id: Uuid,
    pub route: WriteRoute,
    /// Semantic collection, for curated records
    pub collection: Option<String>,
    /// Archive frame, for private, raw and backed-up writes
    pub frame_id: Option<String>,
    pub capsule_id: Option<String>,
    pub score: SignificanceScore,
}

pub struct Engine {
    config: Config,
    router: Router,
    vault: Arc<Vault>,
    scorer: Scorer,
    signals: SignalExtractor,
    embedder: Arc<dyn EmbeddingProvider>,
    archive: ArchiveStore,
    semantic: Arc<SemanticStore>,
    sync: Option<SyncHandle>,
    /// Injected per-tier latency (fault drills)
    latency: DashMap<Tier, Duration>,
    rescoring: AtomicBool,
}

impl Engine {
    /// Open every tier under `config.storage.data_dir` with the configured provider
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let embedder = provider_from_config(&config.embedding)?;
        Self::open_with_provider(config, embedder).await
    }

    /// Open with an explicit embedding provider
    pub async fn open_with_provider(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let vault = Arc::new(Vault::from_config(&config.vault)?);
        let signals = SignalExtractor::new(config.embedding.state_dimension)?;

        let archive_dir = config.storage.archive_dir();
        let archive_config = config.archive.clone();
        let archive =
            blocking(move || ArchiveStore::open(&archive_dir, &archive_config)).await?;

        let semantic = Arc::new(
            SemanticStore::open(
                &config.storage.semantic_dir(),
                embedder.provider_id(),
                embedder.dimension(),
                &config.semantic,
            )
            .await?,
        );
        for name in BUILTIN_COLLECTIONS {
            semantic
                .ensure_collection(name, CollectionSchema::memory_records(), ShardPolicy::None)
                .await?;
        }

        let router = Router::new(config.router.clone());
        let sync = if config.fast.enabled {
            let index = Arc::new(FastIndex::load(
                &config.storage.fast_dir(),
                embedder.dimension(),
                embedder.provider_id(),
            ));
            Some(SyncHandle::spawn(index, Arc::clone(&semantic), &config.fast))
        } else {
            router.set_available(Tier::Fast, false);
            None
        };

        info!(
            data_dir = %config.storage.data_dir.display(),
            provider = embedder.provider_id(),
            dimension = embedder.dimension(),
            archive_frames = archive.len(),
            fast_index = sync.is_some(),
            "Engine opened"
        );

        Ok(Self {
            scorer: Scorer::from_config(&config.scoring),
            config,
            router,
            vault,
            signals,
            embedder,
            archive,
            semantic,
            sync,
            latency: DashMap::new(),
            rescoring: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn semantic(&self) -> &Arc<SemanticStore> {
        &self.semantic
    }

    pub fn fast_index(&self) -> Option<&Arc<FastIndex>> {
        self.sync.as_ref().map(SyncHandle::index)
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Switch a tier on or off. Routing fails closed for tiers that are off.
    pub fn set_tier_available(&self, tier: Tier, available: bool) {
        if tier == Tier::Fast && available && self.sync.is_none() {
            warn!("Fast index is disabled in configuration; ignoring");
            return;
        }
        self.router.set_available(tier, available);
    }

    /// Delay every query against `tier` by `delay` (`None` clears it)
    pub fn set_tier_latency(&self, tier: Tier, delay: Option<Duration>) {
        match delay {
            Some(delay) => {
                self.latency.insert(tier, delay);
            }
            None => {
                self.latency.remove(&tier);
            }
        }
    }

    /// Store one item.
    ///
    /// Validation, classification and tier availability are checked before
    /// anything is written.
    pub async fn write(
        &self,
        item: WriteItem,
        classification: Classification,
    ) -> Result<WriteReceipt> {
        item.validate()?;
        let route = self.router.plan_write(&classification)?;

        let superseded = match (item.supersedes, route) {
            (None, _) => None,
            (Some(old), WriteRoute::Semantic { .. }) => Some(self.locate_superseded(old).await?),
            (Some(_), _) => {
                return Err(StrataError::Validation(
                    "Only curated records can supersede another record".to_string(),
                ));
            }
        };

        let now = Utc::now();
        let id = Uuid::new_v4();
        let created_at = item.created_at.unwrap_or(now);
        let score = self.initial_score(&item, created_at, now)?;

        let receipt = match route {
            WriteRoute::Private => self.write_private(id, &item, created_at, score).await?,
            WriteRoute::Raw { kind } => {
                let entry = archived_entry(id, kind, &item, created_at, score.clone());
                let frame_id = self.append_entry(&entry).await?;
                WriteReceipt {
                    id,
                    route,
                    collection: None,
                    frame_id: Some(frame_id),
                    capsule_id: None,
                    score,
                }
            }
            WriteRoute::Semantic {
                kind,
                archive_backup,
            } => {
                let (mut receipt, embedding) = self
                    .write_semantic(id, kind, &item, created_at, now, score)
                    .await?;
                receipt.route = route;
                let superseded = match (item.supersedes, superseded) {
                    (Some(old), Some(collection)) => {
                        if let Err(e) = self.mark_superseded(&collection, old, id, now).await {
                            self.rollback_semantic(&receipt).await;
                            return Err(e);
                        }
                        Some((old, collection))
                    }
                    _ => None,
                };
                // Last step that can fail: frames cannot be taken back
                if archive_backup {
                    let entry = archived_entry(id, kind, &item, created_at, receipt.score.clone());
                    match self.append_entry(&entry).await {
                        Ok(frame_id) => receipt.frame_id = Some(frame_id),
                        Err(e) => {
                            if let Some((old, collection)) = &superseded {
                                self.unmark_superseded(collection, *old).await;
                            }
                            self.rollback_semantic(&receipt).await;
                            return Err(e);
                        }
                    }
                }
                self.mirror(&receipt, embedding);
                if let (Some(sync), Some((old, _))) = (&self.sync, &superseded) {
                    sync.remove(&old.to_string());
                }
                receipt
            }
        };

        debug!(
            record_id = %receipt.id,
            route = ?receipt.route,
            base_score = receipt.score.base,
            "Stored item"
        );
        Ok(receipt)
    }

    fn initial_score(
        &self,
        item: &WriteItem,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SignificanceScore> {
        let relevance = match item.relevance {
            Some(relevance) => relevance,
            None => {
                let mut labels: Vec<&str> = item.tags.iter().map(String::as_str).collect();
                labels.extend(item.category.as_deref());
                labels.extend(item.subject.as_deref());
                self.signals.relevance(&item.content, &labels)?
            }
        };
        let signals = SignalValues {
            significance: item.significance,
            relevance,
            emotional_impact: item
                .emotional_impact
                .unwrap_or_else(|| self.signals.emotional_impact(&item.content)),
            technical_value: item
                .technical_value
                .unwrap_or_else(|| self.signals.technical_value(&item.content)),
            user_rating: item.user_rating.unwrap_or(NEUTRAL_RATING),
        };
        let base = self.scorer.score(&signals);
        let tier = item
            .decay_tier
            .unwrap_or_else(|| DecayTier::for_base_score(base));
        let mut score = SignificanceScore::new(base, tier, created_at);
        score.current = self.scorer.effective(&score, created_at, now);
        Ok(score)
    }

    async fn write_private(
        &self,
        id: Uuid,
        item: &WriteItem,
        created_at: DateTime<Utc>,
        score: SignificanceScore,
    ) -> Result<WriteReceipt> {
        let entry = archived_entry(id, ContentKind::Private, item, created_at, score.clone());
        let plaintext = Zeroizing::new(entry.to_bytes()?);
        let capsule_id = id.to_string();

        let vault = Arc::clone(&self.vault);
        let archive = self.archive.clone();
        let sealed_id = capsule_id.clone();
        let frame_id = blocking(move || {
            let capsule = vault.seal(&plaintext, &sealed_id)?;
            archive.append(NewFrame::sealed(capsule.to_bytes()?, sealed_id).for_record(id))
        })
        .await?;

        Ok(WriteReceipt {
            id,
            route: WriteRoute::Private,
            collection: None,
            frame_id: Some(frame_id),
            capsule_id: Some(capsule_id),
            score,
        })
    }

    async fn append_entry(&self, entry: &ArchivedEntry) -> Result<String> {
        let payload = entry.to_bytes()?;
        let record_id = entry.record_id;
        let archive = self.archive.clone();
        blocking(move || archive.append(NewFrame::raw(payload).for_record(record_id))).await
    }

    async fn write_semantic(
        &self,
        id: Uuid,
        kind: ContentKind,
        item: &WriteItem,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
        score: SignificanceScore,
    ) -> Result<(WriteReceipt, Vec<f32>)> {
        let record_kind = record_kind(kind, item)?;
        let collection = record_kind.collection().ok_or_else(|| {
            StrataError::Validation(format!("{} has no semantic collection", record_kind.as_str()))
        })?;
        let embedding = self.embed(&item.content).await?;

        let record = MemoryRecord {
            id,
            created_at,
            updated_at: now.max(created_at),
            significance: item.significance,
            confidence: item.confidence,
            embedding,
            tags: item.tags.clone(),
            supersedes: item.supersedes,
            superseded_by: None,
            score,
            kind: record_kind,
        };
        let metadata = record.to_metadata()?;
        self.semantic
            .upsert(collection, &id.to_string(), record.embedding.clone(), metadata)
            .await?;

        let receipt = WriteReceipt {
            id,
            route: WriteRoute::Semantic {
                kind,
                archive_backup: false,
            },
            collection: Some(collection.to_string()),
            frame_id: None,
            capsule_id: None,
            score: record.score,
        };
        Ok((receipt, record.embedding))
    }

    async fn rollback_semantic(&self, receipt: &WriteReceipt) {
        let Some(collection) = &receipt.collection else {
            return;
        };
        if let Err(e) = self
            .semantic
            .delete(collection, &receipt.id.to_string())
            .await
        {
            warn!(record_id = %receipt.id, error = %e, "Failed to roll back semantic write");
        }
    }

    async fn locate_superseded(&self, old: Uuid) -> Result<String> {
        match self.semantic.find(&old.to_string()).await? {
            Some(entry) => Ok(entry.collection),
            None => Err(StrataError::NotFound(format!("superseded record {old}"))),
        }
    }

    async fn mark_superseded(
        &self,
        collection: &str,
        old: Uuid,
        by: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self
            .semantic
            .update_columns(
                collection,
                &old.to_string(),
                &[
                    (
                        "superseded_by",
                        MetadataValue::String(by.to_string()).to_sql_literal(),
                    ),
                    ("updated_at", now.timestamp_micros().to_string()),
                ],
            )
            .await?;
        if !updated {
            warn!(record_id = %old, "Superseded record disappeared before it could be marked");
        }
        Ok(())
    }

    async fn unmark_superseded(&self, collection: &str, old: Uuid) {
        let cleared = self
            .semantic
            .update_columns(collection, &old.to_string(), &[("superseded_by", "NULL".to_string())])
            .await;
        if let Err(e) = cleared {
            warn!(record_id = %old, error = %e, "Failed to restore superseded record");
        }
    }

    fn mirror(&self, receipt: &WriteReceipt, embedding: Vec<f32>) {
        if let (Some(sync), Some(collection)) = (&self.sync, &receipt.collection) {
            sync.mirror(FastEntry {
                record_id: receipt.id.to_string(),
                collection: collection.clone(),
                embedding,
            });
        }
    }

    /// Embed text with the active provider off the async runtime
    pub(crate) async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
        blocking(move || embedder.embed(&text)).await
    }

    /// Fetch a record by id.
    ///
    /// Curated records come from the semantic tier and have their access count
    /// bumped. Archive records are returned as stored; sealed ones are unsealed
    /// through the vault and carry a private reference record.
    pub async fn recall(&self, id: Uuid) -> Result<Recalled> {
        let key = id.to_string();
        let mut offline = None;

        if self.router.is_available(Tier::Semantic) {
            if let Some(entry) = self.semantic.find(&key).await? {
                let mut record = MemoryRecord::from_metadata(id, entry.embedding, &entry.metadata)?;
                self.touch(&entry.collection, &mut record).await?;
                return Ok(Recalled::Record(record));
            }
        } else {
            offline = Some(Tier::Semantic);
        }

        if self.router.is_available(Tier::Archive) {
            let archive = self.archive.clone();
            if let Some(frame) = blocking(move || archive.find_by_record(&id)).await? {
                return self.open_frame(frame).await;
            }
        } else {
            offline = offline.or(Some(Tier::Archive));
        }

        match offline {
            Some(tier) => Err(StrataError::tier_unavailable(
                tier.as_str(),
                format!("record {id} may live on an offline tier"),
            )),
            None => Err(StrataError::NotFound(format!("record {id}"))),
        }
    }

    async fn touch(&self, collection: &str, record: &mut MemoryRecord) -> Result<()> {
        let now = Utc::now();
        self.semantic
            .update_columns(
                collection,
                &record.id.to_string(),
                &[
                    ("access_count", "access_count + 1".to_string()),
                    ("last_accessed", now.timestamp_micros().to_string()),
                ],
            )
            .await?;
        record.score.access_count = record.score.access_count.saturating_add(1);
        record.score.last_accessed = now;
        record.score.current = self.scorer.effective(&record.score, record.created_at, now);
        Ok(())
    }

    async fn open_frame(&self, frame: ArchiveFrame) -> Result<Recalled> {
        if !frame.is_sealed() {
            let entry = ArchivedEntry::from_bytes(&frame.payload)?;
            return Ok(Recalled::Archived {
                frame_id: frame.id,
                sealed: false,
                entry,
                reference: None,
            });
        }

        let vault = Arc::clone(&self.vault);
        let payload = frame.payload;
        let entry = blocking(move || unseal_entry(&vault, &payload)).await?;
        let capsule_id = frame
            .capsule_id
            .unwrap_or_else(|| entry.record_id.to_string());
        let reference = entry.reference(&frame.id, &capsule_id);
        Ok(Recalled::Archived {
            frame_id: frame.id,
            sealed: true,
            entry,
            reference: Some(reference),
        })
    }

    /// Unseal one capsule by id
    pub async fn decrypt(&self, capsule_id: &str) -> Result<ArchivedEntry> {
        self.router.require(Tier::Archive)?;
        let archive = self.archive.clone();
        let id = capsule_id.to_string();
        let frame = blocking(move || archive.find_by_capsule(&id))
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("capsule {capsule_id}")))?;
        let vault = Arc::clone(&self.vault);
        blocking(move || unseal_entry(&vault, &frame.payload)).await
    }

    /// Physically remove a curated record and its fast-index mirror.
    /// Archive frames are immutable and are not touched.
    pub async fn purge(&self, id: Uuid) -> Result<bool> {
        self.router.require(Tier::Semantic)?;
        let key = id.to_string();
        let Some(entry) = self.semantic.find(&key).await? else {
            return Ok(false);
        };
        let removed = self.semantic.delete(&entry.collection, &key).await?;
        if let Some(sync) = &self.sync {
            sync.remove(&key);
        }
        info!(record_id = %id, collection = %entry.collection, "Purged record");
        Ok(removed)
    }

    fn sync_handle(&self) -> Result<&SyncHandle> {
        self.sync
            .as_ref()
            .ok_or_else(|| StrataError::tier_unavailable("fast", "fast index is disabled"))
    }

    /// Rebuild the fast index from the semantic tier; returns the new generation
    pub async fn rebuild_fast_index(&self) -> Result<u64> {
        self.sync_handle()?.rebuild().await
    }

    /// Wait until every queued mirror update is visible in the fast index
    pub async fn sync_fast_index(&self) -> Result<u64> {
        self.sync_handle()?.flush().await
    }

    /// Re-embed a collection with the active provider
    pub async fn migrate_collection(&self, name: &str) -> Result<usize> {
        self.router.require(Tier::Semantic)?;
        let migrated = self
            .semantic
            .migrate_collection(name, self.embedder.as_ref(), CONTENT_FIELD)
            .await?;
        if let Some(sync) = &self.sync {
            if let Err(e) = sync.rebuild().await {
                warn!(collection = name, error = %e, "Fast index rebuild after migration failed");
            }
        }
        Ok(migrated)
    }

    /// Flush the archive and stop the fast-index worker
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(sync) = &self.sync {
            sync.shutdown().await;
        }
        let archive = self.archive.clone();
        blocking(move || archive.flush()).await?;
        info!("Engine shut down");
        Ok(())
    }
}

fn archived_entry(
    id: Uuid,
    kind: ContentKind,
    item: &WriteItem,
    created_at: DateTime<Utc>,
    score: SignificanceScore,
) -> ArchivedEntry {
    ArchivedEntry {
        record_id: id,
        kind,
        created_at,
        content: item.content.clone(),
        label: item.label.clone(),
        tags: item.tags.clone(),
        significance: item.significance,
        confidence: item.confidence,
        score,
    }
}

fn record_kind(kind: ContentKind, item: &WriteItem) -> Result<RecordKind> {
    match kind {
        ContentKind::Insight => Ok(RecordKind::CuratedInsight {
            content: item.content.clone(),
            category: item.category.clone(),
        }),
        ContentKind::Fact => Ok(RecordKind::ExtractedFact {
            content: item.content.clone(),
            subject: item.subject.clone(),
            source: item.source.clone(),
        }),
        ContentKind::Flexible => Ok(RecordKind::FlexibleRecord {
            content: item.content.clone(),
            record_type: item
                .record_type
                .clone()
                .unwrap_or_else(|| DEFAULT_RECORD_TYPE.to_string()),
            payload: item.payload.clone().unwrap_or(serde_json::Value::Null),
        }),
        ContentKind::Dialogue | ContentKind::Snapshot | ContentKind::Private => Err(
            StrataError::Validation(format!("{kind:?} content is not stored as a record")),
        ),
    }
}

fn unseal_entry(vault: &Vault, payload: &[u8]) -> Result<ArchivedEntry> {
    let plaintext = Zeroizing::new(vault.unseal_bytes(payload)?);
    ArchivedEntry::from_bytes(&plaintext)
}

/// Run blocking work (file I/O, key derivation, embedding) off the runtime
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StrataError::Storage(format!("Background task failed: {e}")))?
}
