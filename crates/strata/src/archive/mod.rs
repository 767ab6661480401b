//! Archive tier: append-only, chunked frame storage
//!
//! Frames are appended to the active chunk until it holds
//! `frames_per_chunk` frames, then a new chunk is started. Full chunks are
//! never written again. A single writer lock owns the active chunk; readers
//! only ever touch frames the index already knows about.

pub mod chunk;
pub mod cursor;
pub mod index;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ArchiveConfig;
use crate::error::{Result, StrataError};

pub use chunk::{ArchiveFrame, FrameKind};
pub use cursor::{FrameCursor, ResumeToken};
pub use index::{ArchiveIndex, FrameLocation};

use chunk::{chunk_path, decode_frame, encode_frame, header_bytes, parse_chunk_file_name, scan_chunk};

/// Frame contents supplied by the caller; id and timestamp are assigned on append
#[derive(Debug, Clone)]
pub struct NewFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
    pub record_id: Option<Uuid>,
    pub capsule_id: Option<String>,
}

impl NewFrame {
    pub fn raw(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Raw,
            payload,
            record_id: None,
            capsule_id: None,
        }
    }

    pub fn sealed(payload: Vec<u8>, capsule_id: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Sealed,
            payload,
            record_id: None,
            capsule_id: Some(capsule_id.into()),
        }
    }

    pub fn for_record(mut self, record_id: Uuid) -> Self {
        self.record_id = Some(record_id);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub frames: usize,
    pub chunks: usize,
    pub sealed_frames: usize,
    pub corrupt_frames_skipped: u64,
    pub torn_tails_discarded: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct ActiveChunk {
    seq: u64,
    file: File,
    frames: usize,
    len: u64,
}

struct Writer {
    active: Option<ActiveChunk>,
    last_seq: Option<u64>,
    last_micros: i64,
}

struct Inner {
    dir: PathBuf,
    frames_per_chunk: usize,
    sync_writes: bool,
    /// Swapped whole by `replay`; readers keep the generation they cloned
    index: RwLock<Arc<ArchiveIndex>>,
    writer: Mutex<Writer>,
    corrupt_skipped: Arc<AtomicU64>,
    torn_discarded: AtomicU64,
}

/// Handle to the archive; cheap to clone
#[derive(Clone)]
pub struct ArchiveStore {
    inner: Arc<Inner>,
}

impl ArchiveStore {
    /// Open (or create) the archive in `dir`, replaying every chunk
    pub fn open(dir: &Path, config: &ArchiveConfig) -> Result<Self> {
        if config.frames_per_chunk == 0 {
            return Err(StrataError::Config(
                "archive.frames_per_chunk must be greater than zero".to_string(),
            ));
        }
        fs::create_dir_all(dir)?;

        let store = Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                frames_per_chunk: config.frames_per_chunk,
                sync_writes: config.sync_writes,
                index: RwLock::new(Arc::new(ArchiveIndex::new())),
                writer: Mutex::new(Writer {
                    active: None,
                    last_seq: None,
                    last_micros: 0,
                }),
                corrupt_skipped: Arc::new(AtomicU64::new(0)),
                torn_discarded: AtomicU64::new(0),
            }),
        };

        {
            let mut writer = store.inner.writer.lock();
            store.replay(&mut writer)?;
        }

        info!(
            dir = %dir.display(),
            frames = store.len(),
            chunks = store.index().chunk_count(),
            "Opened archive"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn index(&self) -> Arc<ArchiveIndex> {
        Arc::clone(&self.inner.index.read())
    }

    fn chunk_sequence(&self) -> Result<Vec<u64>> {
        let mut seqs = Vec::new();
        for entry in fs::read_dir(&self.inner.dir)? {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Rebuild the index from chunk files into a fresh generation and swap it
    /// in. Caller holds the writer lock; on error the live index is untouched.
    fn replay(&self, writer: &mut Writer) -> Result<()> {
        let index = ArchiveIndex::new();
        let mut active = None;
        let mut last_seq = None;
        let mut last_micros = writer.last_micros;

        let seqs = self.chunk_sequence()?;
        let last = seqs.last().copied();

        for seq in seqs {
            let path = chunk_path(&self.inner.dir, seq);
            let bytes = fs::read(&path)?;
            let is_last = Some(seq) == last;

            let scan = match scan_chunk(&bytes, seq) {
                Ok(scan) => scan,
                Err(err) => {
                    warn!(chunk = seq, error = %err, "Skipping unreadable chunk");
                    self.inner.corrupt_skipped.fetch_add(1, Ordering::Relaxed);
                    last_seq = Some(seq);
                    continue;
                }
            };

            for err in &scan.corrupt {
                warn!(chunk = seq, error = %err, "Skipping corrupt archive frame");
            }
            self.inner
                .corrupt_skipped
                .fetch_add(scan.corrupt.len() as u64, Ordering::Relaxed);

            index.touch_chunk(seq);
            for scanned in &scan.frames {
                index.insert(&scanned.frame, seq, scanned.offset, scanned.len);
                last_micros = last_micros.max(scanned.frame.timestamp_micros);
            }

            let slots = scan.frames.len() + scan.corrupt.len();
            let mut len = bytes.len() as u64;
            if scan.torn {
                self.inner.torn_discarded.fetch_add(1, Ordering::Relaxed);
                if is_last {
                    warn!(
                        chunk = seq,
                        discarded_bytes = len - scan.valid_len,
                        "Discarding torn tail of active chunk"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    if scan.valid_len == 0 {
                        file.set_len(0)?;
                        (&file).write_all(&header_bytes())?;
                        len = chunk::HEADER_LEN;
                    } else {
                        file.set_len(scan.valid_len)?;
                        len = scan.valid_len;
                    }
                    file.sync_all()?;
                } else {
                    warn!(chunk = seq, "Ignoring torn tail of sealed chunk");
                }
            }

            last_seq = Some(seq);
            if is_last && slots < self.inner.frames_per_chunk {
                let file = OpenOptions::new().append(true).open(&path)?;
                active = Some(ActiveChunk {
                    seq,
                    file,
                    frames: slots,
                    len,
                });
            }
        }

        *self.inner.index.write() = Arc::new(index);
        writer.active = active;
        writer.last_seq = last_seq;
        writer.last_micros = last_micros;
        Ok(())
    }

    /// Rebuild the index by replaying all chunks. Readers keep seeing the
    /// previous index until the new one is complete.
    pub fn rebuild_index(&self) -> Result<()> {
        let mut writer = self.inner.writer.lock();
        self.replay(&mut writer)?;
        debug!(frames = self.len(), "Rebuilt archive index");
        Ok(())
    }

    fn roll_chunk(&self, writer: &mut Writer) -> Result<()> {
        let seq = writer.last_seq.map_or(0, |s| s + 1);
        let path = chunk_path(&self.inner.dir, seq);
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        file.write_all(&header_bytes())?;
        if self.inner.sync_writes {
            file.sync_all()?;
        }
        self.index().touch_chunk(seq);
        writer.last_seq = Some(seq);
        writer.active = Some(ActiveChunk {
            seq,
            file,
            frames: 0,
            len: chunk::HEADER_LEN,
        });
        debug!(chunk = seq, "Started archive chunk");
        Ok(())
    }

    /// Append a frame and return its id
    pub fn append(&self, new_frame: NewFrame) -> Result<String> {
        let mut writer = self.inner.writer.lock();

        // Strictly increasing timestamps keep append order and time order identical
        let now = Utc::now().timestamp_micros();
        let timestamp_micros = now.max(writer.last_micros + 1);
        let frame = ArchiveFrame {
            id: format!("{timestamp_micros:016x}-{:08x}", rand::random::<u32>()),
            timestamp_micros,
            kind: new_frame.kind,
            record_id: new_frame.record_id,
            capsule_id: new_frame.capsule_id,
            payload: new_frame.payload,
        };
        let encoded = encode_frame(&frame)?;

        let full = writer
            .active
            .as_ref()
            .is_none_or(|active| active.frames >= self.inner.frames_per_chunk);
        if full {
            self.roll_chunk(&mut writer)?;
        }
        let Some(active) = writer.active.as_mut() else {
            return Err(StrataError::Storage("No active archive chunk".to_string()));
        };

        let offset = active.len;
        let written = active.file.write_all(&encoded).and_then(|()| {
            if self.inner.sync_writes {
                active.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            discard_tail(&mut writer, offset);
            return Err(err.into());
        }
        active.len += encoded.len() as u64;
        active.frames += 1;
        let seq = active.seq;
        writer.last_micros = timestamp_micros;

        self.index().insert(&frame, seq, offset, encoded.len() as u32);
        debug!(frame_id = %frame.id, chunk = seq, sealed = frame.is_sealed(), "Appended frame");
        Ok(frame.id)
    }

    /// Flush the active chunk to disk
    pub fn flush(&self) -> Result<()> {
        let writer = self.inner.writer.lock();
        if let Some(active) = writer.active.as_ref() {
            active.file.sync_all()?;
        }
        Ok(())
    }

    fn read_location(&self, location: &FrameLocation) -> Result<ArchiveFrame> {
        let mut file = File::open(chunk_path(&self.inner.dir, location.chunk))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut bytes = vec![0u8; location.len as usize];
        file.read_exact(&mut bytes)?;
        decode_frame(&bytes, location.chunk, location.offset)
    }

    pub fn get(&self, frame_id: &str) -> Result<Option<ArchiveFrame>> {
        match self.index().location(frame_id) {
            Some(location) => self.read_location(&location).map(Some),
            None => Ok(None),
        }
    }

    pub fn find_by_record(&self, record_id: &Uuid) -> Result<Option<ArchiveFrame>> {
        match self.index().frame_for_record(record_id) {
            Some(frame_id) => self.get(&frame_id),
            None => Ok(None),
        }
    }

    pub fn find_by_capsule(&self, capsule_id: &str) -> Result<Option<ArchiveFrame>> {
        match self.index().frame_for_capsule(capsule_id) {
            Some(frame_id) => self.get(&frame_id),
            None => Ok(None),
        }
    }

    /// Lazy, ordered frames with timestamps in `[start, end]`
    pub fn read_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> FrameCursor {
        FrameCursor::new(
            self.inner.dir.clone(),
            self.index(),
            Arc::clone(&self.inner.corrupt_skipped),
            start.timestamp_micros(),
            end.timestamp_micros(),
        )
    }

    /// Every frame, oldest first
    pub fn iter_all(&self) -> FrameCursor {
        FrameCursor::new(
            self.inner.dir.clone(),
            self.index(),
            Arc::clone(&self.inner.corrupt_skipped),
            i64::MIN,
            i64::MAX,
        )
    }

    /// Continue a range read after the last frame a previous cursor yielded
    pub fn resume(&self, token: ResumeToken) -> FrameCursor {
        FrameCursor::resume(
            self.inner.dir.clone(),
            self.index(),
            Arc::clone(&self.inner.corrupt_skipped),
            token,
        )
    }

    pub fn len(&self) -> usize {
        self.index().frame_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ArchiveStats {
        let index = self.index();
        let bounds = index.time_bounds();
        let to_time = |micros: i64| chrono::TimeZone::timestamp_micros(&Utc, micros).single();
        ArchiveStats {
            frames: index.frame_count(),
            chunks: index.chunk_count(),
            sealed_frames: index.sealed_count(),
            corrupt_frames_skipped: self.inner.corrupt_skipped.load(Ordering::Relaxed),
            torn_tails_discarded: self.inner.torn_discarded.load(Ordering::Relaxed),
            oldest: bounds.and_then(|(lo, _)| to_time(lo)),
            newest: bounds.and_then(|(_, hi)| to_time(hi)),
        }
    }
}

/// Cut a failed append back to `offset`. A chunk that cannot be truncated is
/// retired so the next append starts a new one instead of writing past the
/// partial frame at an offset the index would not match.
fn discard_tail(writer: &mut Writer, offset: u64) {
    let Some(active) = writer.active.as_ref() else {
        return;
    };
    if let Err(err) = active.file.set_len(offset) {
        warn!(chunk = active.seq, error = %err, "Retiring archive chunk after failed append");
        writer.active = None;
    }
}
