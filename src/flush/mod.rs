//! Flush Module
//!
//! Decides which in-memory state to persist before a planned restart.
//!
//! ```text
//!   targets ──sort by write cost──▶ [c1 ≤ c2 ≤ ... ≤ cN]
//!                                        │
//!        for k in 0..=N:  write(c1..ck) + replay(log above min serial of ck+1..cN)
//!                                        │
//!                                   cheapest k (ties → smaller k)
//! ```

mod candidates;
mod strategy;
mod tls;

use std::sync::Arc;

use crate::chunk::SerialNum;
use crate::error::Result;
use crate::store::LogDataStore;

pub use candidates::{FlushContext, FlushTargetCandidates, TlsReplayCost};
pub use strategy::PrepareRestartFlushStrategy;
pub use tls::{InMemoryTransactionLog, TlsStats, TransactionLog};

/// In-memory state whose persistence shortens log replay
pub trait FlushTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Everything at or below this serial is persisted
    fn flushed_serial(&self) -> SerialNum;

    /// Estimated bytes a flush would write now
    fn approx_bytes_to_write(&self) -> u64;

    /// Persist and return the new flushed serial
    fn flush(&self) -> Result<SerialNum>;
}

/// Exposes a `LogDataStore`'s pending chunk as a flush target
#[derive(Debug, Clone)]
pub struct StoreFlushTarget {
    name: String,
    store: Arc<LogDataStore>,
}

impl StoreFlushTarget {
    pub fn new(name: impl Into<String>, store: Arc<LogDataStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

impl FlushTarget for StoreFlushTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn flushed_serial(&self) -> SerialNum {
        self.store.last_flushed_serial()
    }

    fn approx_bytes_to_write(&self) -> u64 {
        self.store.pending_bytes() as u64
    }

    fn flush(&self) -> Result<SerialNum> {
        self.store.flush()
    }
}
