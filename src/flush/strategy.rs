//! Prepare-restart flush strategy
//!
//! Walks the cost curve `0..=N` once and keeps the cheapest point. Write
//! cost only grows and replay cost only shrinks along the curve, so a single
//! pass is enough.

use std::sync::Arc;

use crate::chunk::SerialNum;
use crate::config::FlushCostConfig;
use crate::error::Result;

use super::candidates::{FlushContext, FlushTargetCandidates};
use super::tls::TransactionLog;
use super::FlushTarget;

/// Picks the flush set that minimizes write cost plus restart replay cost
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareRestartFlushStrategy {
    config: FlushCostConfig,
}

impl PrepareRestartFlushStrategy {
    pub fn new(config: FlushCostConfig) -> Self {
        Self { config }
    }

    /// Cheapest prefix of `sorted`; ties go to the smaller prefix
    pub fn select<'a>(
        &self,
        sorted: &'a [FlushContext],
        tls: &dyn TransactionLog,
    ) -> FlushTargetCandidates<'a> {
        let mut best = FlushTargetCandidates::new(sorted, 0, tls, &self.config);
        for num_candidates in 1..=sorted.len() {
            let next = FlushTargetCandidates::new(sorted, num_candidates, tls, &self.config);
            if next.total_cost() < best.total_cost() {
                best = next;
            }
        }
        best
    }

    /// Select and flush, returning `(name, flushed serial)` per flushed target
    pub fn flush(
        &self,
        targets: &[Arc<dyn FlushTarget>],
        tls: &dyn TransactionLog,
    ) -> Result<Vec<(String, SerialNum)>> {
        let sorted = FlushContext::sorted(targets, &self.config);
        let chosen = self.select(&sorted, tls);

        tracing::info!(
            targets = sorted.len(),
            chosen = chosen.num_candidates(),
            write_cost = chosen.flush_targets_write_cost(),
            replay_cost = chosen.tls_replay_cost().total_cost(),
            replay_above = chosen.replay_above(),
            "prepare restart flush"
        );

        chosen
            .candidates()
            .iter()
            .map(|c| Ok((c.target.name().to_string(), c.target.flush()?)))
            .collect()
    }
}
