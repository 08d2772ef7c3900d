//! Compact Module
//!
//! Rewrites the still-live entries of a frozen file somewhere else so the
//! file can be dropped.
//!
//! ## Writers
//! ```text
//!              FileChunk::visit
//!                     │ CompactEntry
//!        ┌────────────┴─────────────┐
//!        ▼                          ▼
//!   Compacter                 BucketCompacter
//!   relocate now              stage by bucket shard (256)
//!                                   │ close()
//!                                   ▼
//!                             drain shard 0..255, sorted by bucket
//!                                   │
//!                                   ▼
//!                  LogDataStore::relocate (lid lock + re-check)
//! ```
//!
//! Both writers funnel every entry through `LogDataStore::relocate`, which
//! copies it only if the lid still points at the entry's original location.

mod bucket;
mod direct;
mod store_by_bucket;

use crate::chunk::FileId;
use crate::error::Result;
use crate::store::{LogDataStore, Relocation};

pub use bucket::{shard_for, BucketCompacter, NUM_SHARDS};
pub use direct::Compacter;
pub use store_by_bucket::{StagedItem, StagingArena, StoreByBucket};

/// One entry of the file being compacted
#[derive(Debug, Clone, Copy)]
pub struct CompactEntry<'p> {
    pub chunk_id: u32,
    pub lid: u32,
    /// Empty for tombstones
    pub payload: &'p [u8],
}

/// Receives the entries of a compaction source
pub trait CompactionWriter {
    fn write(&mut self, entry: CompactEntry<'_>) -> Result<()>;

    /// Finish the pass and report what happened
    fn close(self: Box<Self>) -> Result<CompactionStats>;
}

/// Where relocated entries go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Whatever file is active when the entry is written
    Active,
    /// A fixed compaction target
    File(FileId),
}

impl Destination {
    /// File the next relocated entry would land in
    pub fn destination_id(self, store: &LogDataStore) -> FileId {
        match self {
            Destination::Active => store.active_file_id(),
            Destination::File(id) => id,
        }
    }
}

/// Counters reported by a compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Entries read from the source
    pub lids_scanned: u64,
    /// Distinct buckets written during drains
    pub buckets_populated: u64,
    /// Source chunks that contributed at least one entry
    pub chunks_processed: u64,
    /// Entries copied to the destination
    pub lids_kept: u64,
    /// Entries superseded before they could be copied
    pub lids_dropped: u64,
    /// Tombstones forgotten because nothing older remains
    pub lids_pruned: u64,
}

impl CompactionStats {
    pub(crate) fn record(&mut self, outcome: Relocation) {
        match outcome {
            Relocation::Kept => self.lids_kept += 1,
            Relocation::Dropped => self.lids_dropped += 1,
            Relocation::Pruned => self.lids_pruned += 1,
        }
    }

    /// Count `chunk_id` once per run of consecutive entries from it
    pub(crate) fn scanned(&mut self, last_chunk: &mut Option<u32>, chunk_id: u32) {
        self.lids_scanned += 1;
        if *last_chunk != Some(chunk_id) {
            self.chunks_processed += 1;
            *last_chunk = Some(chunk_id);
        }
    }
}
