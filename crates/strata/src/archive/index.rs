//! In-memory archive index
//!
//! Maps frame ids, record ids and capsule ids to chunk locations, and keeps
//! the time range of every chunk. Nothing here is persisted: the index is
//! rebuilt by replaying chunk files on open.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::archive::chunk::ArchiveFrame;

/// Where a frame lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    pub chunk: u64,
    /// Position of the frame inside its chunk
    pub slot: usize,
    pub offset: u64,
    /// Encoded length including prefix and checksum
    pub len: u32,
    pub timestamp_micros: i64,
    pub sealed: bool,
}

/// Per-chunk summary used for range pruning
#[derive(Debug, Clone, Default)]
pub struct ChunkEntry {
    pub first_micros: i64,
    pub last_micros: i64,
    pub slots: Vec<FrameLocation>,
}

impl ChunkEntry {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        !self.slots.is_empty() && self.first_micros <= end && self.last_micros >= start
    }
}

#[derive(Debug, Default)]
pub struct ArchiveIndex {
    frames: DashMap<String, FrameLocation>,
    records: DashMap<Uuid, String>,
    capsules: DashMap<String, String>,
    chunks: RwLock<BTreeMap<u64, ChunkEntry>>,
}

impl ArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verified frame. Slots are appended in chunk order.
    pub fn insert(&self, frame: &ArchiveFrame, chunk: u64, offset: u64, len: u32) -> FrameLocation {
        let mut chunks = self.chunks.write();
        let entry = chunks.entry(chunk).or_default();
        let location = FrameLocation {
            chunk,
            slot: entry.slots.len(),
            offset,
            len,
            timestamp_micros: frame.timestamp_micros,
            sealed: frame.is_sealed(),
        };
        if entry.slots.is_empty() {
            entry.first_micros = frame.timestamp_micros;
            entry.last_micros = frame.timestamp_micros;
        } else {
            entry.first_micros = entry.first_micros.min(frame.timestamp_micros);
            entry.last_micros = entry.last_micros.max(frame.timestamp_micros);
        }
        entry.slots.push(location);
        drop(chunks);

        self.frames.insert(frame.id.clone(), location);
        if let Some(record_id) = frame.record_id {
            self.records.insert(record_id, frame.id.clone());
        }
        if let Some(capsule_id) = &frame.capsule_id {
            self.capsules.insert(capsule_id.clone(), frame.id.clone());
        }
        location
    }

    /// Make an empty chunk known (so a fresh active chunk shows up in stats)
    pub fn touch_chunk(&self, chunk: u64) {
        self.chunks.write().entry(chunk).or_default();
    }

    pub fn location(&self, frame_id: &str) -> Option<FrameLocation> {
        self.frames.get(frame_id).map(|entry| *entry)
    }

    pub fn frame_for_record(&self, record_id: &Uuid) -> Option<String> {
        self.records.get(record_id).map(|entry| entry.clone())
    }

    pub fn frame_for_capsule(&self, capsule_id: &str) -> Option<String> {
        self.capsules.get(capsule_id).map(|entry| entry.clone())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn sealed_count(&self) -> usize {
        self.frames.iter().filter(|entry| entry.sealed).count()
    }

    /// Chunk ids overlapping `[start, end]`, ascending, starting at `from_chunk`
    pub fn chunks_overlapping(&self, start: i64, end: i64, from_chunk: u64) -> Vec<u64> {
        self.chunks
            .read()
            .range(from_chunk..)
            .filter(|(_, entry)| entry.overlaps(start, end))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Slot `slot` of `chunk`, if it exists yet
    pub fn slot(&self, chunk: u64, slot: usize) -> Option<FrameLocation> {
        self.chunks
            .read()
            .get(&chunk)
            .and_then(|entry| entry.slots.get(slot).copied())
    }

    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let chunks = self.chunks.read();
        let mut bounds: Option<(i64, i64)> = None;
        for entry in chunks.values().filter(|e| !e.slots.is_empty()) {
            bounds = Some(match bounds {
                None => (entry.first_micros, entry.last_micros),
                Some((lo, hi)) => (lo.min(entry.first_micros), hi.max(entry.last_micros)),
            });
        }
        bounds
    }
}
