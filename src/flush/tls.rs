//! Transaction log boundary
//!
//! The cost model only needs to know how much log would be replayed on
//! restart above a given serial number.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::chunk::SerialNum;

/// Aggregate size of a log range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsStats {
    pub bytes: u64,
    pub operations: u64,
}

/// Replay statistics provider
pub trait TransactionLog: Send + Sync {
    /// Log outstanding for serial numbers strictly above `serial`
    fn replay_stats_above(&self, serial: SerialNum) -> TlsStats;

    /// Highest serial number in the log
    fn last_serial(&self) -> SerialNum;
}

/// Transaction log statistics kept in memory, one record per operation
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    /// serial -> bytes
    entries: RwLock<BTreeMap<SerialNum, u64>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation of `bytes` at `serial`
    pub fn append(&self, serial: SerialNum, bytes: u64) {
        *self.entries.write().entry(serial).or_insert(0) += bytes;
    }

    /// Forget everything at or below `serial`
    pub fn prune(&self, serial: SerialNum) {
        let mut entries = self.entries.write();
        let kept = entries.split_off(&serial.saturating_add(1));
        *entries = kept;
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn replay_stats_above(&self, serial: SerialNum) -> TlsStats {
        let entries = self.entries.read();
        let Some(start) = serial.checked_add(1) else {
            return TlsStats::default();
        };
        entries
            .range(start..)
            .fold(TlsStats::default(), |acc, (_, bytes)| TlsStats {
                bytes: acc.bytes + bytes,
                operations: acc.operations + 1,
            })
    }

    fn last_serial(&self) -> SerialNum {
        self.entries
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }
}
