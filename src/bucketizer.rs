//! Bucketizer
//!
//! Boundary to the distribution layer: maps a lid to the bucket it belongs
//! to. The store only reads assignments, never changes them, and treats the
//! answer as a grouping hint.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::generation::{GenerationGuard, GenerationHandler};

/// Distribution grouping key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BucketId(u64);

impl BucketId {
    /// Build from a sortable bucket key
    pub fn from_key(key: u64) -> Self {
        Self(key)
    }

    /// Sortable key; buckets close in key space are close on disk after a
    /// bucket compaction
    pub fn key(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId({:#018x})", self.0)
    }
}

/// Source of lid → bucket assignments
pub trait Bucketizer: Send + Sync {
    /// Pin the assignment state for a series of lookups
    fn guard(&self) -> GenerationGuard;

    /// Bucket of `lid` as seen through `guard`
    fn bucket_of(&self, guard: &GenerationGuard, lid: u32) -> BucketId;
}

/// In-memory bucketizer backed by an explicit assignment map
///
/// Unassigned lids map to `BucketId::default()`. Every reassignment bumps
/// the generation, so a held guard keeps the bookkeeping comparable to the
/// real distribution layer.
pub struct MapBucketizer {
    assignments: RwLock<HashMap<u32, BucketId>>,
    generations: Arc<GenerationHandler>,
}

impl MapBucketizer {
    pub fn new() -> Self {
        Self {
            assignments: RwLock::new(HashMap::new()),
            generations: Arc::new(GenerationHandler::new()),
        }
    }

    pub fn assign(&self, lid: u32, bucket: BucketId) {
        self.assignments.write().insert(lid, bucket);
        self.generations.increment_generation();
        self.generations.update_oldest_used_generation();
    }

    /// Live guards currently pinning assignment state
    pub fn active_guards(&self) -> usize {
        self.generations.total_refs()
    }
}

impl Default for MapBucketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucketizer for MapBucketizer {
    fn guard(&self) -> GenerationGuard {
        self.generations.acquire()
    }

    fn bucket_of(&self, _guard: &GenerationGuard, lid: u32) -> BucketId {
        self.assignments
            .read()
            .get(&lid)
            .copied()
            .unwrap_or_default()
    }
}
