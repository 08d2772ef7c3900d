//! Tests for the on-disk chunk format
//!
//! These tests verify:
//! - Bit-exact index stream layout (ChunkMeta then LidMeta records, LE)
//! - Data stream is the raw payload concatenation in append order
//! - Torn trailing chunks are cut on open
//! - Inconsistent chunks make open fail with parse counts, even when the
//!   bad record looks like it runs past the end of the index
//! - Header corruption is reported as an invalid header

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use lidstore::chunk::{
    decode_header, ChunkMeta, FileChunk, IndexScan, LidMeta, CHUNK_META_SIZE, LID_META_SIZE,
};
use lidstore::config::Config;
use lidstore::{LogDataStore, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_store(dir: &TempDir, max_chunk_bytes: usize) -> LogDataStore {
    LogDataStore::open(
        Config::builder()
            .data_dir(dir.path())
            .max_chunk_bytes(max_chunk_bytes)
            .build(),
    )
    .unwrap()
}

/// Index and data paths of the only file pair in `dir`
fn only_pair(store: &LogDataStore) -> (PathBuf, PathBuf) {
    let stats = store.file_stats();
    assert_eq!(stats.len(), 1);
    FileChunk::paths(store.data_dir(), stats[0].name_id)
}

fn scan(index_path: &PathBuf, data_path: &PathBuf) -> IndexScan {
    let bytes = fs::read(index_path).unwrap();
    let data_len = fs::metadata(data_path).unwrap().len();
    IndexScan::parse(index_path, &bytes, data_len).unwrap()
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_index_stream_layout_is_bit_exact() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 1 << 20);
    store.write(11, 7, b"hello").unwrap();
    store.write(12, 3, b"wo").unwrap();
    store.flush().unwrap();

    let (index_path, data_path) = only_pair(&store);
    let bytes = fs::read(&index_path).unwrap();
    let (_, header_len) = decode_header(&index_path, &bytes).unwrap();
    let body = &bytes[header_len..];
    assert_eq!(body.len(), CHUNK_META_SIZE + 2 * LID_META_SIZE);

    let mut expected = Vec::new();
    expected.extend_from_slice(&12u64.to_le_bytes());
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.extend_from_slice(&0u64.to_le_bytes());
    expected.extend_from_slice(&7u32.to_le_bytes());
    expected.extend_from_slice(&7u32.to_le_bytes());
    expected.extend_from_slice(&5u32.to_le_bytes());
    expected.extend_from_slice(&3u32.to_le_bytes());
    expected.extend_from_slice(&2u32.to_le_bytes());
    assert_eq!(body, &expected[..]);

    assert_eq!(fs::read(&data_path).unwrap(), b"hellowo");
}

#[test]
fn test_chunks_continue_the_data_stream() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);
    for lid in 0..9u32 {
        store.write(u64::from(lid) + 1, lid, &[lid as u8; 10]).unwrap();
    }
    store.flush().unwrap();

    let (index_path, data_path) = only_pair(&store);
    let scan = scan(&index_path, &data_path);
    assert!(!scan.torn_tail);
    assert_eq!(scan.entry_count(), 9);

    let mut offset = 0u64;
    for chunk in &scan.chunks {
        assert_eq!(chunk.meta.offset, offset);
        let sum: u32 = chunk.entries.iter().map(|e| e.size).sum();
        assert_eq!(sum, chunk.meta.size);
        offset += u64::from(chunk.meta.size);
    }
    assert_eq!(offset, 90);
    // Two 10-byte entries reach the 16-byte threshold
    assert_eq!(scan.chunks[0].entries.len(), 2);
}

#[test]
fn test_tombstone_is_a_zero_size_entry() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 1 << 20);
    store.write(1, 4, b"data").unwrap();
    store.remove(2, 4).unwrap();
    store.flush().unwrap();

    let (index_path, data_path) = only_pair(&store);
    let scan = scan(&index_path, &data_path);
    assert_eq!(
        scan.chunks[0].entries,
        vec![LidMeta { lid: 4, size: 4 }, LidMeta { lid: 4, size: 0 }]
    );
    assert_eq!(scan.chunks[0].meta.size, 4);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_torn_tail_is_truncated_on_open() {
    let dir = TempDir::new().unwrap();
    let (index_path, data_path, intact_len) = {
        let store = open_store(&dir, 1 << 20);
        store.write(1, 1, b"kept").unwrap();
        store.flush().unwrap();
        let (index_path, data_path) = only_pair(&store);
        let intact_len = fs::metadata(&index_path).unwrap().len();
        (index_path, data_path, intact_len)
    };

    // Half a chunk header and some unreferenced payload
    let mut index = OpenOptions::new().append(true).open(&index_path).unwrap();
    index.write_all(&[0xAB; CHUNK_META_SIZE / 2]).unwrap();
    let mut data = OpenOptions::new().append(true).open(&data_path).unwrap();
    data.write_all(b"garbage").unwrap();
    drop((index, data));

    let store = open_store(&dir, 1 << 20);
    assert_eq!(store.read(1).unwrap().unwrap().as_ref(), b"kept");
    assert_eq!(fs::metadata(&index_path).unwrap().len(), intact_len);
    assert_eq!(fs::metadata(&data_path).unwrap().len(), 4);

    store.write(2, 2, b"next").unwrap();
    store.flush().unwrap();
    drop(store);
    let store = open_store(&dir, 1 << 20);
    assert_eq!(store.read(2).unwrap().unwrap().as_ref(), b"next");
}

#[test]
fn test_chunk_without_payload_is_torn() {
    let dir = TempDir::new().unwrap();
    let (index_path, data_path) = {
        let store = open_store(&dir, 1 << 20);
        store.write(1, 1, b"first").unwrap();
        store.flush().unwrap();
        store.write(2, 2, b"second").unwrap();
        store.flush().unwrap();
        only_pair(&store)
    };

    // Index record of the second chunk made it, its payload did not
    let file = OpenOptions::new().write(true).open(&data_path).unwrap();
    file.set_len(5).unwrap();
    drop(file);

    let store = open_store(&dir, 1 << 20);
    assert_eq!(store.read(1).unwrap().unwrap().as_ref(), b"first");
    assert!(store.read(2).unwrap().is_none());
    let scan = scan(&index_path, &data_path);
    assert_eq!(scan.chunks.len(), 1);
}

#[test]
fn test_inconsistent_chunk_refuses_open() {
    let dir = TempDir::new().unwrap();
    let index_path = {
        let store = open_store(&dir, 1 << 20);
        store.write(1, 1, b"aaaa").unwrap();
        store.write(2, 2, b"bbbb").unwrap();
        store.flush().unwrap();
        store.write(3, 3, b"cccc").unwrap();
        store.flush().unwrap();
        store.write(4, 4, b"dddd").unwrap();
        store.flush().unwrap();
        only_pair(&store).0
    };

    // Point the second chunk's offset somewhere else
    let mut bytes = fs::read(&index_path).unwrap();
    let (_, header_len) = decode_header(&index_path, &bytes).unwrap();
    let second = header_len + CHUNK_META_SIZE + 2 * LID_META_SIZE;
    let mut meta: [u8; CHUNK_META_SIZE] = bytes[second..second + CHUNK_META_SIZE]
        .try_into()
        .unwrap();
    let mut decoded = ChunkMeta::decode(&meta);
    assert_eq!(decoded.offset, 8);
    decoded.offset = 3;
    let mut encoded = Vec::new();
    decoded.encode_into(&mut encoded);
    meta.copy_from_slice(&encoded);
    bytes[second..second + CHUNK_META_SIZE].copy_from_slice(&meta);
    fs::write(&index_path, &bytes).unwrap();

    let err = LogDataStore::open(Config::builder().data_dir(dir.path()).build()).unwrap_err();
    match err {
        StoreError::CorruptChunk {
            chunks_parsed,
            entries_parsed,
            ..
        } => {
            assert_eq!(chunks_parsed, 1);
            assert_eq!(entries_parsed, 2);
        }
        other => panic!("expected CorruptChunk, got {:?}", other),
    }
}

/// Flushed file of nine 10-byte entries, two per chunk; returns the index
/// path and the offset of the first chunk record
fn multi_chunk_index(dir: &TempDir) -> (PathBuf, usize) {
    let store = open_store(dir, 16);
    for lid in 0..9u32 {
        store.write(u64::from(lid) + 1, lid, &[lid as u8; 10]).unwrap();
    }
    store.flush().unwrap();
    let index_path = only_pair(&store).0;
    let bytes = fs::read(&index_path).unwrap();
    let (_, header_len) = decode_header(&index_path, &bytes).unwrap();
    (index_path, header_len)
}

fn set_num_entries(index_path: &PathBuf, record: usize, num_entries: u32) {
    let mut bytes = fs::read(index_path).unwrap();
    bytes[record + 8..record + 12].copy_from_slice(&num_entries.to_le_bytes());
    fs::write(index_path, &bytes).unwrap();
}

#[test]
fn test_oversized_entry_count_in_first_chunk_refuses_open() {
    let dir = TempDir::new().unwrap();
    let (index_path, first) = multi_chunk_index(&dir);
    set_num_entries(&index_path, first, 0x00ff_ffff);
    let index_len = fs::metadata(&index_path).unwrap().len();

    let err = LogDataStore::open(Config::builder().data_dir(dir.path()).build()).unwrap_err();
    match err {
        StoreError::CorruptChunk {
            chunks_parsed,
            entries_parsed,
            ..
        } => {
            assert_eq!(chunks_parsed, 0);
            assert_eq!(entries_parsed, 0);
        }
        other => panic!("expected CorruptChunk, got {:?}", other),
    }
    // Nothing was cut from either stream
    assert_eq!(fs::metadata(&index_path).unwrap().len(), index_len);
}

#[test]
fn test_off_by_one_entry_count_refuses_open() {
    let dir = TempDir::new().unwrap();
    let (index_path, first) = multi_chunk_index(&dir);
    set_num_entries(&index_path, first, 3);

    let err = LogDataStore::open(Config::builder().data_dir(dir.path()).build()).unwrap_err();
    assert!(matches!(err, StoreError::CorruptChunk { .. }));
}

#[test]
fn test_zero_entry_chunk_refuses_open() {
    let dir = TempDir::new().unwrap();
    let (index_path, first) = multi_chunk_index(&dir);
    set_num_entries(&index_path, first + CHUNK_META_SIZE + 2 * LID_META_SIZE, 0);

    let err = LogDataStore::open(Config::builder().data_dir(dir.path()).build()).unwrap_err();
    match err {
        StoreError::CorruptChunk { chunks_parsed, .. } => assert_eq!(chunks_parsed, 1),
        other => panic!("expected CorruptChunk, got {:?}", other),
    }
}

#[test]
fn test_record_cut_inside_entries_is_torn() {
    let dir = TempDir::new().unwrap();
    let (index_path, _) = multi_chunk_index(&dir);

    // Drop the last lid meta of the final record
    let len = fs::metadata(&index_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&index_path).unwrap();
    file.set_len(len - LID_META_SIZE as u64 + 3).unwrap();
    drop(file);

    let store = open_store(&dir, 16);
    for lid in 0..8u32 {
        assert_eq!(store.read(lid).unwrap().unwrap().as_ref(), &[lid as u8; 10]);
    }
    assert!(store.read(8).unwrap().is_none());
}

#[test]
fn test_zero_filled_tail_is_torn() {
    let dir = TempDir::new().unwrap();
    let (index_path, _) = multi_chunk_index(&dir);
    let len = fs::metadata(&index_path).unwrap().len();

    let mut index = OpenOptions::new().append(true).open(&index_path).unwrap();
    index.write_all(&[0u8; 100]).unwrap();
    drop(index);

    let store = open_store(&dir, 16);
    assert_eq!(store.read(8).unwrap().unwrap().as_ref(), &[8u8; 10]);
    assert_eq!(fs::metadata(&index_path).unwrap().len(), len);
}

#[test]
fn test_corrupt_header_refuses_open() {
    let dir = TempDir::new().unwrap();
    let index_path = {
        let store = open_store(&dir, 1 << 20);
        store.write(1, 1, b"x").unwrap();
        store.flush().unwrap();
        only_pair(&store).0
    };

    let mut bytes = fs::read(&index_path).unwrap();
    bytes[6] ^= 0xFF;
    fs::write(&index_path, &bytes).unwrap();

    let err = LogDataStore::open(Config::builder().data_dir(dir.path()).build()).unwrap_err();
    assert!(matches!(err, StoreError::InvalidHeader { .. }));
}

#[test]
fn test_name_id_parsing() {
    let dir = TempDir::new().unwrap();
    let (index_path, data_path) = FileChunk::paths(dir.path(), 42);

    assert_eq!(FileChunk::parse_name_id(&index_path), Some(42));
    assert_eq!(FileChunk::parse_name_id(&data_path), None);
    assert_eq!(FileChunk::parse_name_id(&dir.path().join("junk.idx")), None);
}
