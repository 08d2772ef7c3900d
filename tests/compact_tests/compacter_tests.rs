//! Tests for compaction
//!
//! These tests verify:
//! - Compacting an all-stale file keeps nothing
//! - Live entries survive compaction and restart
//! - Entries overwritten after staging are dropped, never applied
//! - Tombstones are pruned once nothing older remains
//! - Bucket grouping orders the destination by bucket key
//! - Retired files stay on disk while a guard can still see them

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use lidstore::bucketizer::{BucketId, Bucketizer, MapBucketizer};
use lidstore::chunk::FileChunk;
use lidstore::compact::{shard_for, BucketCompacter, CompactEntry, CompactionWriter, Destination};
use lidstore::config::{Compression, Config};
use lidstore::executor::{Executor, InlineExecutor, ThreadPoolExecutor};
use lidstore::{CompactionMode, FileId, LogDataStore, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .max_chunk_bytes(64)
        .max_bloat(0.3)
        .build()
}

fn open_store(dir: &TempDir) -> LogDataStore {
    LogDataStore::open(config(dir)).unwrap()
}

fn inline() -> Arc<dyn Executor> {
    Arc::new(InlineExecutor)
}

fn buckets() -> Arc<dyn Bucketizer> {
    Arc::new(MapBucketizer::new())
}

fn payload(lid: u32, version: u32) -> Vec<u8> {
    format!("lid-{}-v{}", lid, version).into_bytes()
}

/// Write lids `0..n` into one file and rotate it out
fn frozen_file(store: &LogDataStore, n: u32) -> FileId {
    for lid in 0..n {
        store.write(u64::from(lid) + 1, lid, &payload(lid, 0)).unwrap();
    }
    let source = store.active_file_id();
    store.rotate().unwrap();
    source
}

// =============================================================================
// Basic Compaction Tests
// =============================================================================

#[test]
fn test_all_stale_source_keeps_nothing() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let source = frozen_file(&store, 20);
    for lid in 0..20u32 {
        store.write(100 + u64::from(lid), lid, &payload(lid, 1)).unwrap();
    }
    let files_before = store.file_count();

    let stats = store
        .compact_file(source, CompactionMode::BucketGrouping, false, buckets(), inline())
        .unwrap();

    assert_eq!(stats.lids_scanned, 20);
    assert_eq!(stats.lids_kept, 0);
    assert_eq!(stats.lids_dropped, 20);
    // Source and the empty target are both gone
    assert_eq!(store.file_count(), files_before - 1);
    for lid in 0..20u32 {
        assert_eq!(store.read(lid).unwrap().unwrap().as_ref(), &payload(lid, 1)[..]);
    }
}

#[test]
fn test_live_entries_survive_compaction_and_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        let source = frozen_file(&store, 30);
        for lid in (0..30u32).step_by(2) {
            store.write(100 + u64::from(lid), lid, &payload(lid, 1)).unwrap();
        }

        let stats = store
            .compact_file(source, CompactionMode::Direct, false, buckets(), inline())
            .unwrap();
        assert_eq!(stats.lids_kept, 15);
        assert_eq!(stats.lids_dropped, 15);
        assert!(stats.chunks_processed > 0);
        assert!(store.file_stats().iter().all(|s| s.file_id != source));

        for lid in 0..30u32 {
            let version = if lid % 2 == 0 { 1 } else { 0 };
            assert_eq!(store.read(lid).unwrap().unwrap().as_ref(), &payload(lid, version)[..]);
        }
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    for lid in 0..30u32 {
        let version = if lid % 2 == 0 { 1 } else { 0 };
        assert_eq!(store.read(lid).unwrap().unwrap().as_ref(), &payload(lid, version)[..]);
    }
}

#[test]
fn test_compact_into_active_file() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let source = frozen_file(&store, 10);

    let stats = store
        .compact_file(source, CompactionMode::BucketGrouping, true, buckets(), inline())
        .unwrap();
    assert_eq!(stats.lids_kept, 10);
    assert_eq!(store.file_count(), 1);

    let active = store.active_file_id();
    for lid in 0..10u32 {
        assert_eq!(store.lid_info(lid).file_id(), active);
        assert_eq!(store.read(lid).unwrap().unwrap().as_ref(), &payload(lid, 0)[..]);
    }
}

#[test]
fn test_compact_into_active_survives_restart_without_flush() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        let source = frozen_file(&store, 10);
        for mode in [CompactionMode::Direct, CompactionMode::BucketGrouping] {
            let source = if mode == CompactionMode::Direct {
                source
            } else {
                store.rotate().unwrap();
                store.file_stats()[0].file_id
            };
            let stats = store
                .compact_file(source, mode, true, buckets(), inline())
                .unwrap();
            assert_eq!(stats.lids_kept, 10);
        }
        // Dropped without an explicit flush
    }

    let store = open_store(&dir);
    for lid in 0..10u32 {
        assert_eq!(
            store.read(lid).unwrap().map(|b| b.to_vec()),
            Some(payload(lid, 0)),
            "lid {}",
            lid
        );
    }
}

#[test]
fn test_compacter_rejects_unknown_source() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let result = BucketCompacter::new(
        10,
        Compression::None,
        &store,
        inline(),
        buckets(),
        FileId(999),
        Destination::Active,
    );
    assert!(matches!(result, Err(StoreError::UnknownFile(999))));
}

#[test]
fn test_active_file_cannot_be_compacted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.write(1, 1, b"x").unwrap();

    let err = store
        .compact_file(store.active_file_id(), CompactionMode::Direct, false, buckets(), inline())
        .unwrap_err();
    assert!(matches!(err, StoreError::WritableSource(_)));
}

// =============================================================================
// Race Tests
// =============================================================================

#[test]
fn test_write_after_staging_wins_over_drain() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let source = frozen_file(&store, 5);
    let target = Destination::Active;

    let mut compacter = Box::new(BucketCompacter::new(
        10,
        Compression::Lz4,
        &store,
        inline(),
        buckets(),
        source,
        target,
    )
    .unwrap());

    // Stage every live entry of the source
    for lid in 0..5u32 {
        let info = store.lid_info(lid);
        let data = store.read(lid).unwrap().unwrap();
        compacter
            .write(CompactEntry {
                chunk_id: info.chunk_id(),
                lid,
                payload: &data,
            })
            .unwrap();
    }
    assert_eq!(compacter.accepted(), 5);

    // Overwrite and remove after staging, before the drain
    store.write(50, 1, b"newer").unwrap();
    store.remove(51, 3).unwrap();

    let stats = compacter.close().unwrap();
    assert_eq!(stats.lids_kept, 3);
    assert_eq!(stats.lids_dropped, 2);

    assert_eq!(store.read(1).unwrap().unwrap().as_ref(), b"newer");
    assert!(store.read(3).unwrap().is_none());
    assert_eq!(store.read(0).unwrap().unwrap().as_ref(), &payload(0, 0)[..]);
}

#[test]
fn test_concurrent_writes_during_compaction() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));
    let source = frozen_file(&store, 200);
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut latest: HashMap<u32, u32> = HashMap::new();
            let mut version = 1u32;
            while !done.load(Ordering::Acquire) || version < 50 {
                for lid in (0..200u32).step_by(7) {
                    store
                        .write(1000 + u64::from(version), lid, &payload(lid, version))
                        .unwrap();
                    latest.insert(lid, version);
                }
                version += 1;
            }
            latest
        })
    };

    let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::new(2, 16).unwrap());
    let stats = store
        .compact_file(source, CompactionMode::BucketGrouping, false, buckets(), pool)
        .unwrap();
    done.store(true, Ordering::Release);
    let latest = writer.join().unwrap();

    assert_eq!(stats.lids_scanned, 200);
    assert_eq!(stats.lids_kept + stats.lids_dropped, 200);
    for lid in 0..200u32 {
        let version = latest.get(&lid).copied().unwrap_or(0);
        assert_eq!(
            store.read(lid).unwrap().unwrap().as_ref(),
            &payload(lid, version)[..],
            "lid {}",
            lid
        );
    }
}

// =============================================================================
// Tombstone Tests
// =============================================================================

#[test]
fn test_tombstone_pruned_from_oldest_file() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.write(1, 1, b"doomed").unwrap();
    let first = store.active_file_id();
    store.rotate().unwrap();
    store.remove(2, 1).unwrap();
    let second = store.active_file_id();
    store.rotate().unwrap();

    // The tombstone still shadows the payload in the older file
    let stats = store
        .compact_file(second, CompactionMode::Direct, false, buckets(), inline())
        .unwrap();
    assert_eq!(stats.lids_pruned, 0);
    assert_eq!(stats.lids_kept, 1);

    let stats = store
        .compact_file(first, CompactionMode::Direct, false, buckets(), inline())
        .unwrap();
    assert_eq!(stats.lids_dropped, 1);

    // Now the copied tombstone lives in the oldest file
    let oldest = store.lid_info(1).file_id();
    let stats = store
        .compact_file(oldest, CompactionMode::Direct, false, buckets(), inline())
        .unwrap();
    assert_eq!(stats.lids_pruned, 1);
    assert!(store.lid_info(1).is_unused());
    assert!(store.read(1).unwrap().is_none());

    drop(store);
    let store = open_store(&dir);
    assert!(store.read(1).unwrap().is_none());
}

// =============================================================================
// Bucket Grouping Tests
// =============================================================================

#[test]
fn test_bucket_grouping_orders_destination_by_bucket() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let bucketizer = Arc::new(MapBucketizer::new());

    // Lids 0..16 in descending bucket order, all in shard 0
    for lid in 0..16u32 {
        bucketizer.assign(lid, BucketId::from_key(u64::from(15 - lid)));
    }
    let source = frozen_file(&store, 16);

    let stats = store
        .compact_file(
            source,
            CompactionMode::BucketGrouping,
            false,
            bucketizer.clone(),
            inline(),
        )
        .unwrap();
    assert_eq!(stats.lids_kept, 16);
    assert_eq!(stats.buckets_populated, 16);
    assert_eq!(bucketizer.active_guards(), 0);

    let mut order = Vec::new();
    store
        .visit(|lid, _| {
            order.push(lid);
            Ok(())
        })
        .unwrap();
    let expected: Vec<u32> = (0..16u32).rev().collect();
    assert_eq!(order, expected);
}

#[test]
fn test_small_arena_drains_early_and_stays_correct() {
    let dir = TempDir::new().unwrap();
    let store = LogDataStore::open(
        Config::builder()
            .data_dir(dir.path())
            .max_chunk_bytes(64)
            .staging_arena_bytes(200)
            .bucketizer_guard_refresh(3)
            .build(),
    )
    .unwrap();
    let bucketizer = Arc::new(MapBucketizer::new());
    for lid in 0..40u32 {
        bucketizer.assign(lid, BucketId::from_key(u64::from(lid % 5) << 40));
    }
    let source = frozen_file(&store, 40);
    store.write(500, 7, b"fresh").unwrap();

    let stats = store
        .compact_file(
            source,
            CompactionMode::BucketGrouping,
            false,
            bucketizer.clone(),
            inline(),
        )
        .unwrap();
    assert_eq!(stats.lids_kept, 39);
    assert_eq!(stats.lids_dropped, 1);
    assert_eq!(bucketizer.active_guards(), 0);

    for lid in 0..40u32 {
        let expected = if lid == 7 { b"fresh".to_vec() } else { payload(lid, 0) };
        assert_eq!(store.read(lid).unwrap().unwrap().as_ref(), &expected[..]);
    }
}

#[test]
fn test_shard_routing_with_ten_significant_bits() {
    // Ten significant bits: top two, six more, two discarded
    let a = shard_for(10, BucketId::from_key(0b00_101010_11));
    let b = shard_for(10, BucketId::from_key(0b01_101010_11));
    let c = shard_for(10, BucketId::from_key(0b10_101010_11));
    let d = shard_for(10, BucketId::from_key(0b11_101010_11));
    assert_eq!([a, b, c, d].iter().collect::<std::collections::HashSet<_>>().len(), 4);

    // Repeated and reordered calls agree; discarded low bits do not matter
    assert_eq!(shard_for(10, BucketId::from_key(0b01_101010_00)), b);
    assert_eq!(shard_for(10, BucketId::from_key(0b01_101010_11)), b);
}

// =============================================================================
// Reclamation Tests
// =============================================================================

#[test]
fn test_retired_file_waits_for_guard() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let source = frozen_file(&store, 5);
    let name_id = store
        .file_stats()
        .iter()
        .find(|s| s.file_id == source)
        .unwrap()
        .name_id;
    let (index_path, data_path) = FileChunk::paths(store.data_dir(), name_id);

    let guard = store.lid_read_guard();
    store
        .compact_file(source, CompactionMode::Direct, true, buckets(), inline())
        .unwrap();
    assert_eq!(store.retired_file_count(), 1);
    assert!(index_path.exists());
    assert!(data_path.exists());

    drop(guard);
    store.reclaim().unwrap();
    assert_eq!(store.retired_file_count(), 0);
    assert!(!index_path.exists());
    assert!(!data_path.exists());
}

#[test]
fn test_compact_worst_picks_the_bloated_file() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    assert!(store.compact_worst(CompactionMode::Direct, buckets(), inline()).unwrap().is_none());

    let mildly = frozen_file(&store, 10);
    let badly = {
        for lid in 100..110u32 {
            store.write(u64::from(lid), lid, &payload(lid, 0)).unwrap();
        }
        let id = store.active_file_id();
        store.rotate().unwrap();
        id
    };
    for lid in 0..4u32 {
        store.write(200 + u64::from(lid), lid, &payload(lid, 1)).unwrap();
    }
    for lid in 100..109u32 {
        store.write(300 + u64::from(lid), lid, &payload(lid, 1)).unwrap();
    }

    assert_eq!(store.worst_file(), Some(badly));
    let stats = store
        .compact_worst(CompactionMode::BucketGrouping, buckets(), inline())
        .unwrap()
        .unwrap();
    assert_eq!(stats.lids_kept, 1);

    assert_eq!(store.worst_file(), Some(mildly));
}

#[test]
fn test_spawned_compaction_reports_through_channel() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));
    let source = frozen_file(&store, 10);
    for lid in 0..8u32 {
        store.write(100 + u64::from(lid), lid, &payload(lid, 1)).unwrap();
    }

    let runner = ThreadPoolExecutor::new(1, 4).unwrap();
    let receiver = store
        .spawn_compact_worst(CompactionMode::BucketGrouping, buckets(), &runner, inline())
        .unwrap();
    let stats = receiver.recv().unwrap().unwrap().unwrap();

    assert_eq!(stats.lids_kept, 2);
    assert!(store.file_stats().iter().all(|s| s.file_id != source));
}
