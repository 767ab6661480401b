//! Chunk file format
//!
//! ```text
//! header: magic "STRC" | version u8
//! frame:  len u32 LE | body (bincode ArchiveFrame) | crc32(body) u32 LE
//! ```
//!
//! A chunk holds a fixed number of frames and is never rewritten once full.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::types::micros_to_datetime;

pub const CHUNK_MAGIC: [u8; 4] = *b"STRC";
pub const CHUNK_VERSION: u8 = 1;
pub const HEADER_LEN: u64 = 5;

/// Length prefix plus trailing checksum
pub const FRAME_OVERHEAD: u64 = 8;

/// Larger length prefixes are treated as garbage
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Raw,
    Sealed,
}

/// Immutable archived unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFrame {
    pub id: String,
    pub timestamp_micros: i64,
    pub kind: FrameKind,
    pub record_id: Option<Uuid>,
    pub capsule_id: Option<String>,
    pub payload: Vec<u8>,
}

impl ArchiveFrame {
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        micros_to_datetime(self.timestamp_micros)
    }

    pub fn is_sealed(&self) -> bool {
        self.kind == FrameKind::Sealed
    }
}

pub fn chunk_file_name(seq: u64) -> String {
    format!("chunk-{seq:08}.log")
}

pub fn parse_chunk_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("chunk-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

pub fn chunk_path(dir: &Path, seq: u64) -> std::path::PathBuf {
    dir.join(chunk_file_name(seq))
}

pub fn header_bytes() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(&CHUNK_MAGIC);
    header[4] = CHUNK_VERSION;
    header
}

/// Serialize a frame with its length prefix and checksum
pub fn encode_frame(frame: &ArchiveFrame) -> Result<Vec<u8>> {
    let body = bincode::serialize(frame)
        .map_err(|e| StrataError::Serialization(format!("Failed to encode frame: {e}")))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            StrataError::Validation(format!("Frame of {} bytes is too large", body.len()))
        })?;

    let mut out = Vec::with_capacity(body.len() + FRAME_OVERHEAD as usize);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(out)
}

/// Decode one encoded frame (prefix, body and checksum) read from `chunk` at `offset`
pub fn decode_frame(bytes: &[u8], chunk: u64, offset: u64) -> Result<ArchiveFrame> {
    let corrupt = |reason: String| StrataError::CorruptFrame {
        chunk,
        offset,
        reason,
    };
    if bytes.len() < FRAME_OVERHEAD as usize {
        return Err(corrupt("frame shorter than its envelope".to_string()));
    }
    let len = read_u32(bytes, 0) as usize;
    if bytes.len() != len + FRAME_OVERHEAD as usize {
        return Err(corrupt(format!(
            "length prefix {len} does not match {} stored bytes",
            bytes.len()
        )));
    }
    let body = &bytes[4..4 + len];
    let stored = read_u32(bytes, 4 + len);
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(corrupt(format!(
            "checksum mismatch: stored {stored:08x}, computed {actual:08x}"
        )));
    }
    bincode::deserialize(body).map_err(|e| corrupt(format!("undecodable body: {e}")))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// A verified frame found while scanning a chunk
#[derive(Debug, Clone)]
pub struct ScannedFrame {
    pub offset: u64,
    /// Encoded length including prefix and checksum
    pub len: u32,
    pub frame: ArchiveFrame,
}

/// Outcome of replaying one chunk file
#[derive(Debug, Default)]
pub struct ChunkScan {
    pub frames: Vec<ScannedFrame>,
    /// Complete frames that failed verification and were skipped
    pub corrupt: Vec<StrataError>,
    /// Length of the verified prefix; everything after it is a torn tail
    pub valid_len: u64,
    pub torn: bool,
}

/// Replay a chunk's bytes, separating verified frames from damage.
///
/// A frame that fails its checksum and is followed by nothing is a torn
/// write. One followed by more data is skipped and reported, and scanning
/// continues after it.
pub fn scan_chunk(bytes: &[u8], chunk: u64) -> Result<ChunkScan> {
    let mut scan = ChunkScan::default();

    if bytes.len() < HEADER_LEN as usize {
        scan.torn = !bytes.is_empty();
        return Ok(scan);
    }
    if bytes[..4] != CHUNK_MAGIC {
        return Err(StrataError::CorruptFrame {
            chunk,
            offset: 0,
            reason: "bad chunk magic".to_string(),
        });
    }
    if bytes[4] != CHUNK_VERSION {
        return Err(StrataError::CorruptFrame {
            chunk,
            offset: 4,
            reason: format!("unsupported chunk version {}", bytes[4]),
        });
    }

    let total = bytes.len() as u64;
    let mut offset = HEADER_LEN;
    scan.valid_len = HEADER_LEN;

    while offset < total {
        let remaining = total - offset;
        if remaining < 4 {
            scan.torn = true;
            break;
        }
        let len = read_u32(bytes, offset as usize);
        if len > MAX_FRAME_LEN {
            // The length prefix itself is garbage; nothing after it can be trusted
            scan.torn = true;
            break;
        }
        let encoded = u64::from(len) + FRAME_OVERHEAD;
        if remaining < encoded {
            scan.torn = true;
            break;
        }

        let end = offset + encoded;
        let slice = &bytes[offset as usize..end as usize];
        match decode_frame(slice, chunk, offset) {
            Ok(frame) => {
                scan.frames.push(ScannedFrame {
                    offset,
                    len: encoded as u32,
                    frame,
                });
                scan.valid_len = end;
            }
            Err(err) if end == total => {
                tracing::debug!(chunk, offset, error = %err, "Discarding torn tail frame");
                scan.torn = true;
                break;
            }
            Err(err) => {
                scan.corrupt.push(err);
                scan.valid_len = end;
            }
        }
        offset = end;
    }

    Ok(scan)
}
