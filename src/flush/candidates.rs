//! Flush Target Candidates
//!
//! Cost of flushing the first `num_candidates` targets of a list sorted by
//! write cost: what it costs to write them now, plus what it costs to replay
//! the transaction log for everything left unflushed.

use std::fmt;
use std::sync::Arc;

use crate::chunk::SerialNum;
use crate::config::FlushCostConfig;

use super::tls::TransactionLog;
use super::FlushTarget;

/// A flush target with its progress and write cost estimate
#[derive(Clone)]
pub struct FlushContext {
    pub target: Arc<dyn FlushTarget>,
    /// Everything at or below this serial is already persisted by the target
    pub last_serial: SerialNum,
    pub write_cost: f64,
}

impl FlushContext {
    pub fn new(target: Arc<dyn FlushTarget>, config: &FlushCostConfig) -> Self {
        let write_cost = target.approx_bytes_to_write() as f64 * config.flush_targets_write_cost;
        Self {
            last_serial: target.flushed_serial(),
            target,
            write_cost,
        }
    }

    /// Contexts for `targets`, ascending by write cost
    pub fn sorted(targets: &[Arc<dyn FlushTarget>], config: &FlushCostConfig) -> Vec<Self> {
        let mut contexts: Vec<Self> = targets
            .iter()
            .map(|t| Self::new(Arc::clone(t), config))
            .collect();
        contexts.sort_by(|a, b| a.write_cost.total_cmp(&b.write_cost));
        contexts
    }
}

impl fmt::Debug for FlushContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushContext")
            .field("target", &self.target.name())
            .field("last_serial", &self.last_serial)
            .field("write_cost", &self.write_cost)
            .finish()
    }
}

/// Weighted cost of replaying the transaction log on restart
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TlsReplayCost {
    pub bytes_cost: f64,
    pub operations_cost: f64,
}

impl TlsReplayCost {
    pub fn total_cost(&self) -> f64 {
        self.bytes_cost + self.operations_cost
    }
}

/// One point of the cost curve: flush the first `num_candidates` contexts
#[derive(Debug, Clone)]
pub struct FlushTargetCandidates<'a> {
    sorted: &'a [FlushContext],
    num_candidates: usize,
    replay_above: SerialNum,
    tls_replay_cost: TlsReplayCost,
    write_cost: f64,
}

impl<'a> FlushTargetCandidates<'a> {
    /// `sorted` must be ascending by write cost; `num_candidates` is clamped
    /// to its length
    pub fn new(
        sorted: &'a [FlushContext],
        num_candidates: usize,
        tls: &dyn TransactionLog,
        config: &FlushCostConfig,
    ) -> Self {
        let num_candidates = num_candidates.min(sorted.len());
        let (flushed, unflushed) = sorted.split_at(num_candidates);

        // Replay resumes after the least advanced target left as it is
        let replay_above = unflushed
            .iter()
            .map(|c| c.last_serial)
            .min()
            .unwrap_or_else(|| tls.last_serial());

        let stats = tls.replay_stats_above(replay_above);
        let tls_replay_cost = TlsReplayCost {
            bytes_cost: stats.bytes as f64 * config.tls_replay_byte_cost,
            operations_cost: stats.operations as f64 * config.tls_replay_operation_cost,
        };
        let write_cost = flushed.iter().map(|c| c.write_cost).sum();

        Self {
            sorted,
            num_candidates,
            replay_above,
            tls_replay_cost,
            write_cost,
        }
    }

    pub fn tls_replay_cost(&self) -> TlsReplayCost {
        self.tls_replay_cost
    }

    pub fn flush_targets_write_cost(&self) -> f64 {
        self.write_cost
    }

    pub fn total_cost(&self) -> f64 {
        self.tls_replay_cost.total_cost() + self.write_cost
    }

    pub fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    /// Serial the log would be replayed from (exclusive)
    pub fn replay_above(&self) -> SerialNum {
        self.replay_above
    }

    /// The contexts that would be flushed
    pub fn candidates(&self) -> &'a [FlushContext] {
        &self.sorted[..self.num_candidates]
    }
}
