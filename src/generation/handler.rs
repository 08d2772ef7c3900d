//! Generation Handler
//!
//! Tracks the current generation and which generations are still pinned.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::Generation;

/// Reference count for one generation
#[derive(Debug)]
struct GenerationHold {
    generation: Generation,
    refs: AtomicUsize,
}

impl GenerationHold {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            refs: AtomicUsize::new(0),
        }
    }
}

/// Hands out guards and tracks the oldest generation still in use
///
/// ## Concurrency:
/// - `acquire()` takes a shared lock on the newest hold only long enough to
///   bump its reference count; it never waits on a writer doing I/O
/// - `increment_generation()` takes the exclusive lock for the pointer swap
/// - Only the newest hold can gain references, so once an older hold drops
///   to zero it stays at zero
pub struct GenerationHandler {
    /// Current generation (mirrors `last.generation`)
    current: AtomicU64,

    /// Oldest generation that may still be pinned by a guard
    oldest_used: AtomicU64,

    /// Hold for the current generation; new guards attach here
    last: RwLock<Arc<GenerationHold>>,

    /// All holds not yet known to be free, oldest first
    holds: Mutex<VecDeque<Arc<GenerationHold>>>,
}

impl GenerationHandler {
    /// Create a handler starting at generation 0
    pub fn new() -> Self {
        let first = Arc::new(GenerationHold::new(0));
        let mut holds = VecDeque::new();
        holds.push_back(Arc::clone(&first));

        Self {
            current: AtomicU64::new(0),
            oldest_used: AtomicU64::new(0),
            last: RwLock::new(first),
            holds: Mutex::new(holds),
        }
    }

    /// Pin the current generation
    pub fn acquire(&self) -> GenerationGuard {
        let last = self.last.read();
        last.refs.fetch_add(1, Ordering::AcqRel);
        GenerationGuard {
            hold: Arc::clone(&last),
        }
    }

    /// Advance to the next generation
    ///
    /// Callers publish their new state before calling this.
    pub fn increment_generation(&self) -> Generation {
        let mut last = self.last.write();
        let next = last.generation + 1;
        let hold = Arc::new(GenerationHold::new(next));

        self.holds.lock().push_back(Arc::clone(&hold));
        *last = hold;
        self.current.store(next, Ordering::Release);
        next
    }

    /// Drop bookkeeping for unpinned generations and return the oldest one
    /// that may still be in use
    pub fn update_oldest_used_generation(&self) -> Generation {
        let current = self.current.load(Ordering::Acquire);
        let mut holds = self.holds.lock();

        while let Some(front) = holds.front() {
            if front.generation >= current || front.refs.load(Ordering::Acquire) > 0 {
                break;
            }
            holds.pop_front();
        }

        let oldest = holds.front().map(|h| h.generation).unwrap_or(current);
        self.oldest_used.store(oldest, Ordering::Release);
        oldest
    }

    pub fn current_generation(&self) -> Generation {
        self.current.load(Ordering::Acquire)
    }

    /// Oldest used generation as of the last `update_oldest_used_generation`
    pub fn oldest_used_generation(&self) -> Generation {
        self.oldest_used.load(Ordering::Acquire)
    }

    /// Number of live guards pinning `generation`
    pub fn generation_refs(&self, generation: Generation) -> usize {
        self.holds
            .lock()
            .iter()
            .find(|h| h.generation == generation)
            .map(|h| h.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of live guards across all generations
    pub fn total_refs(&self) -> usize {
        self.holds
            .lock()
            .iter()
            .map(|h| h.refs.load(Ordering::Acquire))
            .sum()
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationHandler")
            .field("current", &self.current_generation())
            .field("oldest_used", &self.oldest_used_generation())
            .finish()
    }
}

/// Pins one generation until dropped
pub struct GenerationGuard {
    hold: Arc<GenerationHold>,
}

impl GenerationGuard {
    /// The generation this guard pins
    pub fn generation(&self) -> Generation {
        self.hold.generation
    }
}

impl Clone for GenerationGuard {
    fn clone(&self) -> Self {
        self.hold.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            hold: Arc::clone(&self.hold),
        }
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.hold.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for GenerationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationGuard")
            .field("generation", &self.generation())
            .finish()
    }
}
