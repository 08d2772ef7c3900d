//! Bucket Compacter
//!
//! Two phases:
//! 1. **Scan**: every entry of the source is staged in the shard of its
//!    bucket. The bucket comes from the bucketizer and may already be stale;
//!    it only decides placement.
//! 2. **Drain** (`close`): shards are emptied in order, each sorted by bucket
//!    key, and every entry is re-validated against the lid table before it
//!    is written. Entries overwritten or removed in the meantime are dropped.
//!
//! If the staging arena runs out during the scan, all shards are drained
//! early and the scan continues with an empty arena.

use std::sync::Arc;

use crossbeam::sync::WaitGroup;

use crate::bucketizer::{BucketId, Bucketizer};
use crate::chunk::{FileId, SerialNum};
use crate::config::Compression;
use crate::error::Result;
use crate::executor::Executor;
use crate::generation::GenerationGuard;
use crate::lid::LidInfo;
use crate::store::LogDataStore;

use super::store_by_bucket::ENTRY_OVERHEAD;
use super::{
    CompactEntry, CompactionStats, CompactionWriter, Destination, StagingArena, StoreByBucket,
};

/// Shards the bucket key space is split into
pub const NUM_SHARDS: usize = 256;

/// Shard for `bucket` given the number of significant bucket key bits
///
/// The low `bits - 8` bits are discarded and the next 8 bits pick the shard,
/// so buckets that differ only in discarded bits always share a shard.
pub fn shard_for(max_significant_bucket_bits: u32, bucket: BucketId) -> usize {
    let unsignificant = max_significant_bucket_bits.saturating_sub(8);
    let shifted = bucket.key().checked_shr(unsignificant).unwrap_or(0);
    (shifted % NUM_SHARDS as u64) as usize
}

/// Bucket-grouping compaction writer
pub struct BucketCompacter<'a> {
    max_significant_bucket_bits: u32,
    store: &'a LogDataStore,
    executor: Arc<dyn Executor>,
    bucketizer: Arc<dyn Bucketizer>,
    source: FileId,
    destination: Destination,
    serial_floor: SerialNum,

    /// Pinned bucketizer state, replaced every `guard_refresh` writes
    guard: Option<GenerationGuard>,
    guard_refresh: u32,
    writes_since_refresh: u32,

    arena: Arc<StagingArena>,
    shards: Vec<StoreByBucket>,
    /// Outstanding compression tasks
    pending: WaitGroup,

    last_chunk: Option<u32>,
    accepted: u64,
    early_drains: u64,
    stats: CompactionStats,
}

impl<'a> BucketCompacter<'a> {
    pub fn new(
        max_significant_bucket_bits: u32,
        compression: Compression,
        store: &'a LogDataStore,
        executor: Arc<dyn Executor>,
        bucketizer: Arc<dyn Bucketizer>,
        source: FileId,
        destination: Destination,
    ) -> Result<Self> {
        let serial_floor = store.file(source)?.last_serial();
        let config = store.config();
        let arena = Arc::new(StagingArena::new(config.staging_arena_bytes));
        let shards = (0..NUM_SHARDS)
            .map(|_| StoreByBucket::new(Arc::clone(&arena), compression, config.max_chunk_bytes))
            .collect();

        Ok(Self {
            max_significant_bucket_bits,
            store,
            executor,
            bucketizer,
            source,
            destination,
            serial_floor,
            guard: None,
            guard_refresh: config.bucketizer_guard_refresh,
            writes_since_refresh: 0,
            arena,
            shards,
            pending: WaitGroup::new(),
            last_chunk: None,
            accepted: 0,
            early_drains: 0,
            stats: CompactionStats::default(),
        })
    }

    /// Entries staged so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn arena(&self) -> &StagingArena {
        &self.arena
    }

    /// Look up the bucket of `lid`, refreshing the guard when it is due
    fn bucket_of(&mut self, lid: u32) -> BucketId {
        if self.writes_since_refresh >= self.guard_refresh {
            self.guard = None;
        }
        let guard = match self.guard.take() {
            Some(guard) => guard,
            None => {
                self.writes_since_refresh = 0;
                self.bucketizer.guard()
            }
        };
        self.writes_since_refresh += 1;
        let bucket = self.bucketizer.bucket_of(&guard, lid);
        self.guard = Some(guard);
        bucket
    }

    /// Wait for compression, then relocate everything staged so far
    fn drain_all(&mut self) -> Result<()> {
        std::mem::replace(&mut self.pending, WaitGroup::new()).wait();

        for shard in 0..NUM_SHARDS {
            if self.shards[shard].is_empty() {
                continue;
            }
            let items = self.shards[shard].drain()?;

            let mut previous: Option<BucketId> = None;
            for item in items {
                if previous != Some(item.bucket) {
                    self.stats.buckets_populated += 1;
                    previous = Some(item.bucket);
                }
                let expected = LidInfo::new(self.source, item.chunk_id, item.payload.len() as u32)?;
                let outcome = self.store.relocate(
                    item.lid,
                    expected,
                    self.destination,
                    &item.payload,
                    self.serial_floor,
                )?;
                self.stats.record(outcome);
            }
        }
        Ok(())
    }
}

impl CompactionWriter for BucketCompacter<'_> {
    fn write(&mut self, entry: CompactEntry<'_>) -> Result<()> {
        self.stats.scanned(&mut self.last_chunk, entry.chunk_id);

        let bucket = self.bucket_of(entry.lid);
        let shard = shard_for(self.max_significant_bucket_bits, bucket);

        let reserved = entry.payload.len() + ENTRY_OVERHEAD;
        if !self.arena.try_reserve(reserved) {
            tracing::debug!(
                source = %self.source,
                used = self.arena.used(),
                capacity = self.arena.capacity(),
                "staging arena full, draining early"
            );
            self.early_drains += 1;
            self.drain_all()?;
            if !self.arena.try_reserve(reserved) {
                self.arena.force_reserve(reserved);
            }
        }

        self.shards[shard].add(
            bucket,
            entry.chunk_id,
            entry.lid,
            entry.payload,
            reserved,
            self.executor.as_ref(),
            &self.pending,
        )?;
        self.accepted += 1;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<CompactionStats> {
        // Assignments are not needed past the scan
        self.guard = None;
        self.drain_all()?;

        tracing::debug!(
            source = %self.source,
            destination = %self.destination.destination_id(self.store),
            accepted = self.accepted,
            kept = self.stats.lids_kept,
            dropped = self.stats.lids_dropped,
            buckets = self.stats.buckets_populated,
            early_drains = self.early_drains,
            arena_peak = self.arena.peak(),
            "bucket compaction closed"
        );
        Ok(self.stats)
    }
}
