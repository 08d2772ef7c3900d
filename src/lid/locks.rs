//! Per-lid locks
//!
//! A fixed set of mutexes striped by lid. Two lids may share a stripe; one
//! lid always maps to the same stripe, which is all the ordering needs.

use parking_lot::{Mutex, MutexGuard};

/// Held while mutating or re-validating one lid
pub type LidGuard<'a> = MutexGuard<'a, ()>;

pub struct LidLocks {
    stripes: Box<[Mutex<()>]>,
}

impl LidLocks {
    pub const DEFAULT_STRIPES: usize = 1024;

    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, lid: u32) -> LidGuard<'_> {
        self.stripes[lid as usize % self.stripes.len()].lock()
    }
}

impl Default for LidLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STRIPES)
    }
}
