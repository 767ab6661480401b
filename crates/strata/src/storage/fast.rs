//! Fast index: exact nearest-neighbour search over an in-memory matrix
//!
//! The index is a sequence of immutable generations. Readers clone the
//! current `Arc` and search it without holding any lock; a rebuild or a
//! mirror batch builds a complete new generation and swaps it in. Nothing in
//! here is authoritative; the whole index can be rebuilt from the semantic
//! store.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedding::check_vector;
use crate::error::{Result, StrataError};

const INDEX_FILE: &str = "index.bin";

/// Vector mirrored from the semantic store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastEntry {
    pub record_id: String,
    pub collection: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FastHit {
    pub record_id: String,
    pub collection: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    record_id: String,
    collection: String,
}

/// One immutable, fully built index
pub struct IndexGeneration {
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    dimension: usize,
    /// Row `i` holds the vector of `slots[i]`
    matrix: Array2<f32>,
    slots: Vec<Slot>,
    by_id: HashMap<String, usize>,
}

impl IndexGeneration {
    fn empty(dimension: usize) -> Self {
        Self {
            generation: 0,
            built_at: Utc::now(),
            dimension,
            matrix: Array2::zeros((0, dimension)),
            slots: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    fn build(generation: u64, dimension: usize, entries: Vec<FastEntry>) -> Result<Self> {
        // Later entries for the same id win
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, FastEntry> = HashMap::new();
        for entry in entries {
            check_vector(&entry.embedding, dimension)?;
            if !latest.contains_key(&entry.record_id) {
                order.push(entry.record_id.clone());
            }
            latest.insert(entry.record_id.clone(), entry);
        }

        let mut data = Vec::with_capacity(order.len() * dimension);
        let mut slots = Vec::with_capacity(order.len());
        for id in order {
            let Some(entry) = latest.remove(&id) else {
                continue;
            };
            data.extend_from_slice(&entry.embedding);
            slots.push(Slot {
                record_id: entry.record_id,
                collection: entry.collection,
            });
        }
        Self::from_rows(generation, dimension, slots, data)
    }

    /// `data` holds `slots.len()` vectors back to back
    fn from_rows(generation: u64, dimension: usize, slots: Vec<Slot>, data: Vec<f32>) -> Result<Self> {
        let by_id = slots
            .iter()
            .enumerate()
            .map(|(row, slot)| (slot.record_id.clone(), row))
            .collect();
        let matrix = Array2::from_shape_vec((slots.len(), dimension), data)
            .map_err(|e| StrataError::Storage(format!("Failed to shape index matrix: {e}")))?;
        Ok(Self {
            generation,
            built_at: Utc::now(),
            dimension,
            matrix,
            slots,
            by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.by_id.contains_key(record_id)
    }

    fn entries(&self) -> Vec<FastEntry> {
        self.slots
            .iter()
            .enumerate()
            .map(|(row, slot)| FastEntry {
                record_id: slot.record_id.clone(),
                collection: slot.collection.clone(),
                embedding: self.matrix.row(row).to_vec(),
            })
            .collect()
    }

    /// Top `k` slots by inner product
    pub fn search(&self, query: &[f32], k: usize) -> Vec<FastHit> {
        if k == 0 || self.slots.is_empty() {
            return Vec::new();
        }
        let scores = self.matrix.dot(&ArrayView1::from(query));
        let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        let by_score = |a: &(usize, f32), b: &(usize, f32)| -> CmpOrdering {
            b.1.total_cmp(&a.1)
                .then_with(|| self.slots[a.0].record_id.cmp(&self.slots[b.0].record_id))
        };
        if ranked.len() > k {
            ranked.select_nth_unstable_by(k - 1, by_score);
            ranked.truncate(k);
        }
        ranked.sort_by(by_score);
        ranked
            .into_iter()
            .map(|(row, similarity)| FastHit {
                record_id: self.slots[row].record_id.clone(),
                collection: self.slots[row].collection.clone(),
                similarity,
            })
            .collect()
    }
}

/// On-disk form of a generation
#[derive(Serialize, Deserialize)]
struct Snapshot {
    provider_id: String,
    dimension: usize,
    generation: u64,
    entries: Vec<FastEntry>,
}

pub struct FastIndex {
    dir: PathBuf,
    dimension: usize,
    provider_id: String,
    current: RwLock<Arc<IndexGeneration>>,
    next_generation: AtomicU64,
    stale: AtomicBool,
}

impl FastIndex {
    /// Empty index; marked stale so the first sync rebuilds it
    pub fn new(dir: &Path, dimension: usize, provider_id: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            dimension,
            provider_id: provider_id.to_string(),
            current: RwLock::new(Arc::new(IndexGeneration::empty(dimension))),
            next_generation: AtomicU64::new(1),
            stale: AtomicBool::new(true),
        }
    }

    /// Load the cached index if it was built for this provider.
    /// A missing, unreadable or mismatched cache yields a stale empty index.
    pub fn load(dir: &Path, dimension: usize, provider_id: &str) -> Self {
        let index = Self::new(dir, dimension, provider_id);
        let path = dir.join(INDEX_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return index,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read fast index cache");
                return index;
            }
        };
        let snapshot: Snapshot = match bincode::deserialize(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable fast index cache");
                return index;
            }
        };
        if snapshot.dimension != dimension || snapshot.provider_id != provider_id {
            info!("Fast index cache belongs to another provider; rebuilding");
            return index;
        }
        match IndexGeneration::build(snapshot.generation, dimension, snapshot.entries) {
            Ok(generation) => {
                info!(
                    generation = generation.generation,
                    vectors = generation.len(),
                    "Loaded fast index cache"
                );
                index
                    .next_generation
                    .store(snapshot.generation + 1, Ordering::SeqCst);
                *index.current.write() = Arc::new(generation);
                index.stale.store(false, Ordering::SeqCst);
                index
            }
            Err(e) => {
                warn!(error = %e, "Discarding invalid fast index cache");
                index
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current generation; stays valid while newer ones are swapped in
    pub fn snapshot(&self) -> Arc<IndexGeneration> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Record that mirror updates were lost and a full rebuild is due
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Called by a rebuilder before it starts reading its source. Updates lost
    /// while the rebuild runs mark the index stale again and survive the swap.
    pub fn clear_stale(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }

    fn swap(&self, generation: IndexGeneration) -> u64 {
        let id = generation.generation;
        *self.current.write() = Arc::new(generation);
        id
    }

    /// Build a complete generation from `entries` and swap it in.
    /// Leaves the stale flag alone; see `clear_stale`.
    pub fn build_from(&self, entries: Vec<FastEntry>) -> Result<u64> {
        let generation_id = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let generation = match IndexGeneration::build(generation_id, self.dimension, entries) {
            Ok(generation) => generation,
            Err(e) => {
                self.mark_stale();
                return Err(e);
            }
        };
        let vectors = generation.len();
        let id = self.swap(generation);
        info!(generation = id, vectors, "Swapped in rebuilt fast index");
        Ok(id)
    }

    /// Copy-on-write update: current entries plus `upserts`, minus `removals`.
    /// Upserted ids already present keep their row; new ids are appended.
    ///
    /// Rows are copied once from the current matrix into the new one, so a
    /// fold costs O(N) in the index size. `fast.sync_interval_ms` bounds how
    /// often that happens; an empty batch copies nothing.
    pub fn apply(&self, upserts: Vec<FastEntry>, removals: &[String]) -> Result<u64> {
        let base = self.snapshot();
        if upserts.is_empty() && removals.is_empty() {
            return Ok(base.generation);
        }
        for entry in &upserts {
            check_vector(&entry.embedding, self.dimension)?;
        }

        let removed: HashSet<&str> = removals.iter().map(String::as_str).collect();
        let upserted = upserts.len();
        // Later upserts for the same id win
        let mut pending: HashMap<String, FastEntry> = HashMap::with_capacity(upserts.len());
        let mut appended = Vec::new();
        for entry in upserts {
            if removed.contains(entry.record_id.as_str()) {
                continue;
            }
            if !base.contains(&entry.record_id) && !pending.contains_key(&entry.record_id) {
                appended.push(entry.record_id.clone());
            }
            pending.insert(entry.record_id.clone(), entry);
        }

        let rows = base.len() + appended.len();
        let mut data = Vec::with_capacity(rows * self.dimension);
        let mut slots = Vec::with_capacity(rows);
        for (row, slot) in base.slots.iter().enumerate() {
            if removed.contains(slot.record_id.as_str()) {
                continue;
            }
            match pending.remove(&slot.record_id) {
                Some(entry) => {
                    data.extend_from_slice(&entry.embedding);
                    slots.push(Slot {
                        record_id: entry.record_id,
                        collection: entry.collection,
                    });
                }
                None => {
                    data.extend(base.matrix.row(row).iter().copied());
                    slots.push(slot.clone());
                }
            }
        }
        for id in appended {
            if let Some(entry) = pending.remove(&id) {
                data.extend_from_slice(&entry.embedding);
                slots.push(Slot {
                    record_id: entry.record_id,
                    collection: entry.collection,
                });
            }
        }

        let generation_id = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let generation = IndexGeneration::from_rows(generation_id, self.dimension, slots, data)?;
        let id = self.swap(generation);
        debug!(generation = id, upserted, removed = removals.len(), "Applied mirror batch");
        Ok(id)
    }

    pub fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<FastHit>> {
        check_vector(embedding, self.dimension)?;
        Ok(self.snapshot().search(embedding, k))
    }

    /// Write the current generation to the cache file (tmp file, then rename)
    pub fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let current = self.snapshot();
        let snapshot = Snapshot {
            provider_id: self.provider_id.clone(),
            dimension: self.dimension,
            generation: current.generation,
            entries: current.entries(),
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| StrataError::Serialization(format!("Failed to encode fast index: {e}")))?;
        let path = self.dir.join(INDEX_FILE);
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        debug!(generation = current.generation, "Persisted fast index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str, v: [f32; 3]) -> FastEntry {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        FastEntry {
            record_id: id.to_string(),
            collection: "facts".to_string(),
            embedding: v.iter().map(|x| x / norm).collect(),
        }
    }

    #[test]
    fn test_query_ranks_by_inner_product() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        index
            .build_from(vec![
                entry("x", [1.0, 0.0, 0.0]),
                entry("y", [0.0, 1.0, 0.0]),
                entry("xy", [1.0, 1.0, 0.0]),
            ])
            .unwrap();
        let hits = index.query(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record_id, "x");
        assert_eq!(hits[1].record_id, "xy");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        assert!(index.query(&[1.0, 0.0], 1).is_err());
        let bad = FastEntry {
            record_id: "bad".to_string(),
            collection: "facts".to_string(),
            embedding: vec![1.0],
        };
        assert!(
            index
                .build_from(vec![entry("x", [1.0, 0.0, 0.0]), bad])
                .is_err()
        );
        assert!(index.is_stale());
    }

    #[test]
    fn test_old_generation_survives_swap() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        index.build_from(vec![entry("a", [1.0, 0.0, 0.0])]).unwrap();
        let held = index.snapshot();
        index
            .build_from(vec![entry("b", [0.0, 1.0, 0.0])])
            .unwrap();
        assert!(held.contains("a"));
        assert!(!held.contains("b"));
        assert!(index.snapshot().contains("b"));
        assert!(index.snapshot().generation > held.generation);
    }

    #[test]
    fn test_apply_upserts_and_removals() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        index
            .build_from(vec![entry("a", [1.0, 0.0, 0.0]), entry("b", [0.0, 1.0, 0.0])])
            .unwrap();
        index
            .apply(
                vec![entry("c", [0.0, 0.0, 1.0]), entry("a", [0.0, 1.0, 1.0])],
                &["b".to_string()],
            )
            .unwrap();
        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.contains("b"));
        let hits = index.query(&[0.0, 0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].record_id, "c");
    }

    #[test]
    fn test_apply_keeps_rows_in_place() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        index
            .build_from(vec![
                entry("a", [1.0, 0.0, 0.0]),
                entry("b", [0.0, 1.0, 0.0]),
                entry("c", [0.0, 0.0, 1.0]),
            ])
            .unwrap();
        index
            .apply(
                vec![
                    entry("d", [1.0, 1.0, 0.0]),
                    entry("b", [0.0, 0.5, 0.5]),
                    entry("d", [0.0, 1.0, 1.0]),
                ],
                &["a".to_string()],
            )
            .unwrap();

        let snapshot = index.snapshot();
        let ids: Vec<&str> = snapshot.slots.iter().map(|s| s.record_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
        assert_eq!(snapshot.matrix.row(0).to_vec(), vec![0.0, 0.5, 0.5]);
        assert_eq!(snapshot.matrix.row(1).to_vec(), vec![0.0, 0.0, 1.0]);
        assert_eq!(snapshot.matrix.row(2).to_vec(), vec![0.0, 1.0, 1.0]);
        assert_eq!(snapshot.by_id.get("d"), Some(&2));
    }

    #[test]
    fn test_empty_batch_keeps_generation() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        index.build_from(vec![entry("a", [1.0, 0.0, 0.0])]).unwrap();
        let before = index.snapshot();
        assert_eq!(index.apply(Vec::new(), &[]).unwrap(), before.generation);
        assert!(Arc::ptr_eq(&before, &index.snapshot()));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        assert!(index.is_stale());
        index.clear_stale();
        let generation = index
            .build_from(vec![entry("a", [1.0, 0.0, 0.0])])
            .unwrap();
        assert!(!index.is_stale());
        index.persist().unwrap();

        let loaded = FastIndex::load(dir.path(), 3, "test");
        assert!(!loaded.is_stale());
        assert_eq!(loaded.generation(), generation);
        assert_eq!(loaded.len(), 1);

        let other = FastIndex::load(dir.path(), 3, "other-provider");
        assert!(other.is_stale());
        assert!(other.is_empty());
    }

    #[test]
    fn test_loss_during_build_keeps_index_stale() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        index.clear_stale();
        // A mirror entry dropped while the source is being scanned
        index.mark_stale();
        index.build_from(vec![entry("a", [1.0, 0.0, 0.0])]).unwrap();
        assert!(index.is_stale());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let dir = tempdir().unwrap();
        let index = FastIndex::new(dir.path(), 3, "test");
        assert!(index.query(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }
}
