//! Periodic significance re-scoring
//!
//! Effective scores are always derived from the immutable base score, so a
//! pass only refreshes the cached `current_score` column and running it twice
//! at the same instant changes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Result;
use crate::memory::types::{BUILTIN_COLLECTIONS, MemoryRecord};
use crate::router::Tier;
use crate::storage::metadata::MetadataValue;

/// Smallest change worth writing back
const SCORE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RescoreReport {
    pub scanned: usize,
    pub updated: usize,
    /// Records whose effective score sits below the retrieval floor
    pub below_floor: usize,
    /// Collections left alone until migrated
    pub skipped_collections: Vec<String>,
    /// Another pass was in progress; nothing was done
    pub already_running: bool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Engine {
    pub async fn rescore(&self) -> Result<RescoreReport> {
        self.rescore_at(Utc::now()).await
    }

    /// Recompute the effective score of every curated record as of `now`
    pub async fn rescore_at(&self, now: DateTime<Utc>) -> Result<RescoreReport> {
        if self
            .rescoring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rescore already running");
            return Ok(RescoreReport {
                already_running: true,
                ..Default::default()
            });
        }
        let _running = RunningGuard(&self.rescoring);
        self.router.require(Tier::Semantic)?;

        let mut report = RescoreReport::default();
        let collections = self.semantic.collection_names();
        let scored = collections
            .into_iter()
            .filter(|name| BUILTIN_COLLECTIONS.contains(&name.as_str()));
        for collection in scored {
            if let Some(reason) = self.semantic.needs_migration(&collection).await? {
                warn!(%collection, %reason, "Skipping rescore until migrated");
                report.skipped_collections.push(collection);
                continue;
            }

            for entry in self.semantic.scan(&collection, None).await? {
                let Ok(id) = Uuid::parse_str(&entry.id) else {
                    continue;
                };
                let record = match MemoryRecord::from_metadata(id, Vec::new(), &entry.metadata) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(%collection, id = %entry.id, error = %e, "Skipping undecodable record");
                        continue;
                    }
                };
                report.scanned += 1;

                let effective = self.scorer.effective(&record.score, record.created_at, now);
                if !self.scorer.is_above_floor(effective) {
                    report.below_floor += 1;
                }
                if (effective - record.score.current).abs() <= SCORE_EPSILON {
                    continue;
                }
                self.semantic
                    .update_columns(
                        &collection,
                        &entry.id,
                        &[(
                            "current_score",
                            MetadataValue::Float(effective).to_sql_literal(),
                        )],
                    )
                    .await?;
                report.updated += 1;
            }
        }

        info!(
            scanned = report.scanned,
            updated = report.updated,
            below_floor = report.below_floor,
            "Rescore pass complete"
        );
        Ok(report)
    }

    /// Run `rescore` on the configured interval until the engine is dropped
    pub fn spawn_rescorer(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Engine> = Arc::downgrade(self);
        let every = Duration::from_secs(self.config.scoring.decay.rescore_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Engine dropped; stopping rescorer");
                    break;
                };
                if let Err(e) = engine.rescore().await {
                    error!(error = %e, "Rescore pass failed");
                }
            }
        })
    }
}
