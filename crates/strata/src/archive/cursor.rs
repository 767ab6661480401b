//! Lazy, restartable range reads

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::archive::chunk::{ArchiveFrame, chunk_path, decode_frame};
use crate::archive::index::{ArchiveIndex, FrameLocation};
use crate::error::{Result, StrataError};

/// Position after the last frame a cursor yielded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub start_micros: i64,
    pub end_micros: i64,
    pub chunk: u64,
    pub slot: usize,
}

/// Ordered frames with timestamps in `[start, end]`.
///
/// Frames are read one at a time from disk. Frames that fail verification are
/// logged and skipped. Frames appended after the cursor was created are
/// visible if they fall inside the range.
pub struct FrameCursor {
    dir: PathBuf,
    index: Arc<ArchiveIndex>,
    corrupt_skipped: Arc<AtomicU64>,
    start: i64,
    end: i64,
    chunk: Option<u64>,
    slot: usize,
    open: Option<(u64, File)>,
}

impl FrameCursor {
    pub(crate) fn new(
        dir: PathBuf,
        index: Arc<ArchiveIndex>,
        corrupt_skipped: Arc<AtomicU64>,
        start: i64,
        end: i64,
    ) -> Self {
        let chunk = index.chunks_overlapping(start, end, 0).first().copied();
        Self {
            dir,
            index,
            corrupt_skipped,
            start,
            end,
            chunk,
            slot: 0,
            open: None,
        }
    }

    pub(crate) fn resume(
        dir: PathBuf,
        index: Arc<ArchiveIndex>,
        corrupt_skipped: Arc<AtomicU64>,
        token: ResumeToken,
    ) -> Self {
        Self {
            dir,
            index,
            corrupt_skipped,
            start: token.start_micros,
            end: token.end_micros,
            chunk: Some(token.chunk),
            slot: token.slot,
            open: None,
        }
    }

    /// Token that restarts the read right after the last yielded frame
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.chunk.map(|chunk| ResumeToken {
            start_micros: self.start,
            end_micros: self.end,
            chunk,
            slot: self.slot,
        })
    }

    fn read_at(&mut self, location: &FrameLocation) -> Result<ArchiveFrame> {
        let reuse = matches!(&self.open, Some((chunk, _)) if *chunk == location.chunk);
        if !reuse {
            let file = File::open(chunk_path(&self.dir, location.chunk))?;
            self.open = Some((location.chunk, file));
        }
        let Some((_, file)) = self.open.as_mut() else {
            return Err(StrataError::Storage("Chunk file not open".to_string()));
        };
        file.seek(SeekFrom::Start(location.offset))?;
        let mut bytes = vec![0u8; location.len as usize];
        file.read_exact(&mut bytes)?;
        decode_frame(&bytes, location.chunk, location.offset)
    }
}

impl Iterator for FrameCursor {
    type Item = Result<ArchiveFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.chunk?;
            let Some(location) = self.index.slot(chunk, self.slot) else {
                let next = self
                    .index
                    .chunks_overlapping(self.start, self.end, chunk + 1)
                    .first()
                    .copied();
                match next {
                    Some(next) => {
                        self.chunk = Some(next);
                        self.slot = 0;
                        continue;
                    }
                    // Stay on the last chunk so the token picks up later appends
                    None => return None,
                }
            };
            self.slot += 1;

            if location.timestamp_micros < self.start || location.timestamp_micros > self.end {
                continue;
            }

            match self.read_at(&location) {
                Ok(frame) => return Some(Ok(frame)),
                Err(err @ StrataError::CorruptFrame { .. }) => {
                    tracing::warn!(error = %err, "Skipping corrupt archive frame");
                    self.corrupt_skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
