//! Store-side compaction
//!
//! Picks a source file, drives a `CompactionWriter` over its entries and
//! retires the source afterwards. Every relocation re-validates the entry
//! against the lid table under the lid lock.

use std::sync::Arc;
use std::time::Instant;

use crate::bucketizer::Bucketizer;
use crate::chunk::{ChunkVisitor, FileId, SerialNum};
use crate::compact::{
    BucketCompacter, CompactEntry, Compacter, CompactionStats, CompactionWriter, Destination,
};
use crate::error::{Result, StoreError};
use crate::executor::Executor;
use crate::lid::LidInfo;

use super::LogDataStore;

/// How entries of a compacted file are regrouped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionMode {
    /// Re-append each entry as it is scanned
    Direct,
    /// Stage entries per bucket shard and write them grouped by bucket
    BucketGrouping,
}

/// Outcome of re-validating one staged entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// Still current; copied to the destination
    Kept,
    /// Overwritten or removed since it was staged
    Dropped,
    /// A tombstone with nothing older left to shadow; forgotten
    Pruned,
}

impl LogDataStore {
    /// Copy one entry to `destination` if it is still the live entry of `lid`
    ///
    /// `expected` is the location the entry had in the source file. The
    /// check and the copy happen under the lid lock, the same lock ordinary
    /// writers take, so a racing write either lands first (and the copy is
    /// dropped) or lands after the copy (and supersedes it).
    pub fn relocate(
        &self,
        lid: u32,
        expected: LidInfo,
        destination: Destination,
        payload: &[u8],
        serial_floor: SerialNum,
    ) -> Result<Relocation> {
        let (outcome, written_to) = {
            let _lid_guard = self.lock_lid(lid);

            let current = self.lid_info(lid);
            if current != expected {
                return Ok(Relocation::Dropped);
            }

            if expected.is_empty() && self.is_oldest(expected.file_id())? {
                self.prune(lid, current)?;
                return Ok(Relocation::Pruned);
            }

            let (file, chunk_id) = match destination {
                Destination::Active => {
                    let serial = serial_floor.max(self.active_file().last_serial());
                    self.append_active(serial, lid, payload)?
                }
                Destination::File(file_id) => {
                    let file = self.file(file_id)?;
                    let serial = serial_floor.max(file.last_serial());
                    let chunk_id = file
                        .append(serial, lid, payload)?
                        .ok_or(StoreError::FrozenTarget(file_id.0))?;
                    (file, chunk_id)
                }
            };

            self.publish(lid, LidInfo::new(file.file_id(), chunk_id, expected.size())?)?;
            (Relocation::Kept, file)
        };

        if matches!(destination, Destination::Active) {
            self.rotate_if_full(&written_to)?;
        }
        Ok(outcome)
    }

    /// Compact `source` into `destination`
    ///
    /// The active file cannot be a source; rotate first. With
    /// `Destination::File` the target is created here, ordered directly
    /// after the source, and frozen when the pass completes.
    pub fn compact_file(
        &self,
        source: FileId,
        mode: CompactionMode,
        to_active: bool,
        bucketizer: Arc<dyn Bucketizer>,
        executor: Arc<dyn Executor>,
    ) -> Result<CompactionStats> {
        let started = Instant::now();
        let file = self.file(source)?;
        if file.is_writable() || source == self.active_file_id() {
            return Err(StoreError::WritableSource(source.0));
        }
        if self.is_retired(source) {
            return Err(StoreError::UnknownFile(source.0));
        }

        // Step 1: Destination
        let target = if to_active {
            None
        } else {
            Some(self.create_compaction_target(&file)?)
        };
        let destination = match &target {
            Some(t) => Destination::File(t.file_id()),
            None => Destination::Active,
        };

        tracing::info!(
            %source,
            ?destination,
            ?mode,
            bloat = file.stats().bloat(),
            "compaction started"
        );

        // Step 2: Scan
        let mut writer: Box<dyn CompactionWriter + '_> = match mode {
            CompactionMode::Direct => Box::new(Compacter::new(self, source, destination)?),
            CompactionMode::BucketGrouping => Box::new(BucketCompacter::new(
                self.config().max_significant_bucket_bits,
                self.config().compression,
                self,
                executor,
                bucketizer,
                source,
                destination,
            )?),
        };
        file.visit(&mut ScanAdapter {
            writer: writer.as_mut(),
        })?;

        // Step 3: Drain and seal
        let stats = writer.close()?;
        if let Some(target) = &target {
            target.freeze()?;
            if target.stats().entries == 0 {
                self.retire(target.file_id())?;
            }
        }

        // Step 4: Relocated entries must be durable before the source goes
        if target.is_none() {
            self.flush()?;
        }

        // Step 5: Retire the source once nothing can reach it
        self.retire(source)?;

        tracing::info!(
            %source,
            lids_scanned = stats.lids_scanned,
            lids_kept = stats.lids_kept,
            lids_dropped = stats.lids_dropped,
            lids_pruned = stats.lids_pruned,
            buckets = stats.buckets_populated,
            chunks = stats.chunks_processed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(stats)
    }

    /// Frozen file with the highest bloat above `max_bloat`, if any
    pub fn worst_file(&self) -> Option<FileId> {
        let active = self.active_file_id();
        self.file_stats()
            .into_iter()
            .filter(|s| !s.writable && s.file_id != active && !self.is_retired(s.file_id))
            .filter(|s| s.entries > 0 && s.bloat() > self.config().max_bloat)
            .max_by(|a, b| a.bloat().total_cmp(&b.bloat()))
            .map(|s| s.file_id)
    }

    /// Compact the worst file, if one exceeds the bloat limit
    pub fn compact_worst(
        &self,
        mode: CompactionMode,
        bucketizer: Arc<dyn Bucketizer>,
        executor: Arc<dyn Executor>,
    ) -> Result<Option<CompactionStats>> {
        match self.worst_file() {
            Some(source) => self
                .compact_file(source, mode, false, bucketizer, executor)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Run `compact_worst` as a background job on `runner`
    ///
    /// Staging work goes to `staging`, which must not be a pool whose only
    /// worker is running this job. The result is delivered through the
    /// returned channel.
    pub fn spawn_compact_worst(
        self: &Arc<Self>,
        mode: CompactionMode,
        bucketizer: Arc<dyn Bucketizer>,
        runner: &dyn Executor,
        staging: Arc<dyn Executor>,
    ) -> Result<crossbeam::channel::Receiver<Result<Option<CompactionStats>>>> {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        let store = Arc::clone(self);

        runner.execute(Box::new(move || {
            let result = store.compact_worst(mode, bucketizer, staging);
            if let Err(e) = &result {
                tracing::error!(error = %e, "background compaction failed");
            }
            // Receiver may have been dropped; the job ran regardless
            let _ = sender.send(result);
        }))?;

        Ok(receiver)
    }
}

/// Feeds a file visit into a compaction writer
struct ScanAdapter<'w, 'a> {
    writer: &'w mut (dyn CompactionWriter + 'a),
}

impl ChunkVisitor for ScanAdapter<'_, '_> {
    fn visit(&mut self, chunk_id: u32, lid: u32, payload: &[u8]) -> Result<()> {
        self.writer.write(CompactEntry {
            chunk_id,
            lid,
            payload,
        })
    }
}
