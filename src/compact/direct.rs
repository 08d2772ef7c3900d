//! Direct compaction: relocate each entry as soon as it is scanned.

use crate::chunk::{FileId, SerialNum};
use crate::error::Result;
use crate::lid::LidInfo;
use crate::store::LogDataStore;

use super::{CompactEntry, CompactionStats, CompactionWriter, Destination};

/// Re-appends every still-live entry into the destination in scan order
pub struct Compacter<'a> {
    store: &'a LogDataStore,
    source: FileId,
    destination: Destination,
    serial_floor: SerialNum,
    last_chunk: Option<u32>,
    stats: CompactionStats,
}

impl<'a> Compacter<'a> {
    /// Fails with `UnknownFile` if `source` is not a file of `store`
    pub fn new(store: &'a LogDataStore, source: FileId, destination: Destination) -> Result<Self> {
        let serial_floor = store.file(source)?.last_serial();
        Ok(Self {
            store,
            source,
            destination,
            serial_floor,
            last_chunk: None,
            stats: CompactionStats::default(),
        })
    }
}

impl CompactionWriter for Compacter<'_> {
    fn write(&mut self, entry: CompactEntry<'_>) -> Result<()> {
        self.stats.scanned(&mut self.last_chunk, entry.chunk_id);

        let expected = LidInfo::new(self.source, entry.chunk_id, entry.payload.len() as u32)?;
        let outcome = self.store.relocate(
            entry.lid,
            expected,
            self.destination,
            entry.payload,
            self.serial_floor,
        )?;
        self.stats.record(outcome);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<CompactionStats> {
        tracing::debug!(
            source = %self.source,
            kept = self.stats.lids_kept,
            dropped = self.stats.lids_dropped,
            "direct compaction closed"
        );
        Ok(self.stats)
    }
}
