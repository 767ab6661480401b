//! Integration tests for the archive tier
//!
//! Exercises chunk rolling, crash recovery and restartable range reads
//! against real chunk files.

use std::fs::OpenOptions;
use std::path::Path;

use chrono::{Duration, Utc};
use strata::archive::chunk::{chunk_path, parse_chunk_file_name};
use strata::archive::{ArchiveStore, NewFrame};
use strata::config::ArchiveConfig;
use tempfile::tempdir;

fn config(frames_per_chunk: usize) -> ArchiveConfig {
    let mut config = ArchiveConfig::default();
    config.frames_per_chunk = frames_per_chunk;
    config.sync_writes = false;
    config
}

fn payload(i: usize) -> Vec<u8> {
    format!("frame payload number {i}").into_bytes()
}

fn highest_chunk(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(parse_chunk_file_name))
        .max()
        .unwrap()
}

mod recovery_tests {
    use super::*;

    #[test]
    fn test_torn_tail_drops_exactly_one_frame() {
        let dir = tempdir().unwrap();
        {
            let store = ArchiveStore::open(dir.path(), &config(128)).unwrap();
            for i in 0..1000 {
                store.append(NewFrame::raw(payload(i))).unwrap();
            }
            store.flush().unwrap();
            assert_eq!(store.len(), 1000);
        }

        // Simulate a crash in the middle of the last write
        let path = chunk_path(dir.path(), highest_chunk(dir.path()));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let store = ArchiveStore::open(dir.path(), &config(128)).unwrap();
        assert_eq!(store.len(), 999);
        assert_eq!(store.stats().torn_tails_discarded, 1);

        let frames: Vec<_> = store.iter_all().map(|f| f.unwrap()).collect();
        assert_eq!(frames.len(), 999);
        assert_eq!(frames.last().unwrap().payload, payload(998));
    }

    #[test]
    fn test_appends_continue_after_recovery() {
        let dir = tempdir().unwrap();
        {
            let store = ArchiveStore::open(dir.path(), &config(10)).unwrap();
            for i in 0..25 {
                store.append(NewFrame::raw(payload(i))).unwrap();
            }
        }
        let path = chunk_path(dir.path(), highest_chunk(dir.path()));
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let store = ArchiveStore::open(dir.path(), &config(10)).unwrap();
        assert_eq!(store.len(), 24);
        let id = store.append(NewFrame::raw(b"after crash".to_vec())).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().payload, b"after crash");

        drop(store);
        let reopened = ArchiveStore::open(dir.path(), &config(10)).unwrap();
        assert_eq!(reopened.len(), 25);
        assert_eq!(reopened.stats().torn_tails_discarded, 0);
    }

    #[test]
    fn test_corrupt_frame_in_sealed_chunk_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let store = ArchiveStore::open(dir.path(), &config(10)).unwrap();
            for i in 0..20 {
                store.append(NewFrame::raw(payload(i))).unwrap();
            }
        }

        // Flip one payload byte inside the first (full) chunk
        let path = chunk_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let needle = payload(3);
        let at = bytes
            .windows(needle.len())
            .position(|w| w == needle.as_slice())
            .unwrap();
        bytes[at] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let store = ArchiveStore::open(dir.path(), &config(10)).unwrap();
        let frames: Vec<_> = store.iter_all().map(|f| f.unwrap()).collect();
        assert_eq!(frames.len(), 19);
        assert!(frames.iter().all(|f| f.payload != payload(3)));
        assert!(store.stats().corrupt_frames_skipped >= 1);
    }
}

mod range_tests {
    use super::*;

    #[test]
    fn test_range_read_is_ordered_and_bounded() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path(), &config(16)).unwrap();
        let ids: Vec<String> = (0..50)
            .map(|i| store.append(NewFrame::raw(payload(i))).unwrap())
            .collect();

        let all: Vec<_> = store.iter_all().map(|f| f.unwrap()).collect();
        let first = all[10].timestamp().unwrap();
        let last = all[19].timestamp().unwrap();

        let window: Vec<_> = store
            .read_range(first, last)
            .map(|f| f.unwrap().id)
            .collect();
        assert_eq!(window, ids[10..20].to_vec());
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path(), &config(16)).unwrap();
        for i in 0..5 {
            store.append(NewFrame::raw(payload(i))).unwrap();
        }
        let past = Utc::now() - Duration::days(30);
        assert_eq!(store.read_range(past, past + Duration::days(1)).count(), 0);
    }

    #[test]
    fn test_resume_token_continues_after_last_frame() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path(), &config(8)).unwrap();
        for i in 0..30 {
            store.append(NewFrame::raw(payload(i))).unwrap();
        }

        let mut cursor = store.iter_all();
        let head: Vec<_> = cursor.by_ref().take(12).map(|f| f.unwrap().payload).collect();
        let token = cursor.resume_token().unwrap();
        drop(cursor);

        let tail: Vec<_> = store.resume(token).map(|f| f.unwrap().payload).collect();
        assert_eq!(head.len() + tail.len(), 30);
        assert_eq!(tail.first().unwrap(), &payload(12));
        assert_eq!(tail.last().unwrap(), &payload(29));
    }

    #[test]
    fn test_token_picks_up_later_appends() {
        let dir = tempdir().unwrap();
        let store = ArchiveStore::open(dir.path(), &config(8)).unwrap();
        for i in 0..5 {
            store.append(NewFrame::raw(payload(i))).unwrap();
        }

        let mut cursor = store.iter_all();
        assert_eq!(cursor.by_ref().count(), 5);
        let token = cursor.resume_token().unwrap();

        for i in 5..9 {
            store.append(NewFrame::raw(payload(i))).unwrap();
        }
        let later: Vec<_> = store.resume(token).map(|f| f.unwrap().payload).collect();
        assert_eq!(later, (5..9).map(payload).collect::<Vec<_>>());
    }

    #[test]
    fn test_token_survives_reopen() {
        let dir = tempdir().unwrap();
        let token = {
            let store = ArchiveStore::open(dir.path(), &config(4)).unwrap();
            for i in 0..10 {
                store.append(NewFrame::raw(payload(i))).unwrap();
            }
            let mut cursor = store.iter_all();
            cursor.by_ref().take(6).for_each(|f| {
                f.unwrap();
            });
            let token = cursor.resume_token().unwrap();
            serde_json::to_string(&token).unwrap()
        };

        let store = ArchiveStore::open(dir.path(), &config(4)).unwrap();
        let token = serde_json::from_str(&token).unwrap();
        let rest: Vec<_> = store.resume(token).map(|f| f.unwrap().payload).collect();
        assert_eq!(rest, (6..10).map(payload).collect::<Vec<_>>());
    }
}
