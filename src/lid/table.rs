//! Lid Table
//!
//! Growable array of packed `LidInfo` words.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StoreError};
use crate::generation::{GenerationGuard, GenerationHandler, GenerationHoldList};

use super::LidInfo;

type Slots = Arc<Vec<AtomicU64>>;

/// Map from lid to its current `LidInfo`
///
/// ## Concurrency:
/// - Single-slot loads and stores are atomic and take the `slots` lock in
///   shared mode only; callers serialize stores per lid with `LidLocks`
/// - Growth takes the lock exclusively for the copy + pointer swap, then
///   retires the old array to the hold list
/// - `snapshot()` pins a generation and clones the array handle, after which
///   lookups take no lock at all
pub struct LidTable {
    slots: RwLock<Slots>,
    retired: Mutex<GenerationHoldList<Slots>>,
    generations: Arc<GenerationHandler>,
    /// One past the highest lid ever set
    limit: AtomicU32,
}

impl LidTable {
    /// Lids must stay below this bound
    pub const MAX_LIDS: u32 = 1 << 31;

    const INITIAL_CAPACITY: usize = 1024;

    pub fn new(generations: Arc<GenerationHandler>) -> Self {
        Self {
            slots: RwLock::new(Self::allocate(Self::INITIAL_CAPACITY)),
            retired: Mutex::new(GenerationHoldList::new()),
            generations,
            limit: AtomicU32::new(0),
        }
    }

    /// Current location of `lid`; unused lids read as the empty info
    pub fn get(&self, lid: u32) -> LidInfo {
        let slots = self.slots.read();
        slots
            .get(lid as usize)
            .map(|slot| LidInfo::from_raw(slot.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Store the location of `lid`; the caller holds the lid's lock
    pub fn set(&self, lid: u32, info: LidInfo) -> Result<()> {
        if lid >= Self::MAX_LIDS {
            return Err(StoreError::LidOutOfRange {
                lid,
                limit: Self::MAX_LIDS,
            });
        }
        self.ensure_capacity(lid as usize + 1);

        {
            let slots = self.slots.read();
            slots[lid as usize].store(info.raw(), Ordering::Release);
        }
        self.limit.fetch_max(lid + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Forget `lid` entirely
    pub fn clear(&self, lid: u32) {
        let slots = self.slots.read();
        if let Some(slot) = slots.get(lid as usize) {
            slot.store(0, Ordering::Release);
        }
    }

    /// One past the highest lid ever set
    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    /// Allocated slots, for diagnostics
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Arrays retired by growth but still pinned by a guard
    pub fn retired_arrays(&self) -> usize {
        self.retired.lock().len()
    }

    /// Pin the current generation and capture the current array
    pub fn snapshot(&self) -> LidSnapshot {
        let guard = self.generations.acquire();
        let slots = Arc::clone(&self.slots.read());
        LidSnapshot {
            _guard: guard,
            slots,
            limit: self.limit(),
        }
    }

    /// Free retired arrays no guard can still observe
    pub fn reclaim(&self) {
        let oldest = self.generations.update_oldest_used_generation();
        let freed = self.retired.lock().reclaim(oldest);
        if !freed.is_empty() {
            tracing::trace!(count = freed.len(), oldest, "reclaimed lid arrays");
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn allocate(capacity: usize) -> Slots {
        Arc::new((0..capacity).map(|_| AtomicU64::new(0)).collect())
    }

    fn ensure_capacity(&self, needed: usize) {
        if self.slots.read().len() >= needed {
            return;
        }

        let old = {
            let mut slots = self.slots.write();
            if slots.len() >= needed {
                return;
            }
            // Step 1: Copy into a larger array and publish it
            let capacity = needed.max(slots.len() * 2);
            let grown: Vec<AtomicU64> = (0..capacity)
                .map(|i| {
                    AtomicU64::new(slots.get(i).map_or(0, |s| s.load(Ordering::Acquire)))
                })
                .collect();
            std::mem::replace(&mut *slots, Arc::new(grown))
        };

        // Step 2: Retire the old array, advance, reclaim
        let retire_at = self.generations.current_generation();
        self.retired.lock().hold(retire_at, old);
        self.generations.increment_generation();
        self.reclaim();
    }
}

/// Generation-pinned view of the lid table
///
/// Reflects every store made before the snapshot was taken. Stores after
/// growth land in a newer array and are not visible here.
pub struct LidSnapshot {
    _guard: GenerationGuard,
    slots: Slots,
    limit: u32,
}

impl LidSnapshot {
    pub fn get(&self, lid: u32) -> LidInfo {
        self.slots
            .get(lid as usize)
            .map(|slot| LidInfo::from_raw(slot.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Lid limit when the snapshot was taken
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// All lids below the limit with a non-empty location
    pub fn live_lids(&self) -> impl Iterator<Item = (u32, LidInfo)> + '_ {
        (0..self.limit).filter_map(move |lid| {
            let info = self.get(lid);
            (!info.is_empty()).then_some((lid, info))
        })
    }
}
