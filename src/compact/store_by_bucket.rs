//! Store By Bucket
//!
//! Staging buffer for one bucket shard. Entries are packed into staging
//! chunks; a full chunk is sealed and, with `Compression::Lz4`, compressed
//! on the executor while the scan continues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;

use crate::bucketizer::BucketId;
use crate::config::Compression;
use crate::error::{Result, StoreError};
use crate::executor::Executor;

/// Bookkeeping charged to the arena per staged entry on top of its payload
pub(crate) const ENTRY_OVERHEAD: usize = std::mem::size_of::<StagedEntry>();

/// Byte budget shared by every shard of one compaction pass
#[derive(Debug)]
pub struct StagingArena {
    capacity: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl StagingArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Reserve `bytes` if the budget allows it
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let reserved = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(bytes)?;
                (next <= self.capacity).then_some(next)
            });
        match reserved {
            Ok(previous) => {
                self.peak.fetch_max(previous + bytes, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Reserve `bytes` even past the budget
    ///
    /// Used for an entry larger than what a drained arena can hold.
    pub fn force_reserve(&self, bytes: usize) {
        let previous = self.used.fetch_add(bytes, Ordering::AcqRel);
        self.peak.fetch_max(previous + bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Highest reservation seen
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Header of one staged entry; the payload lives in the chunk's data buffer
#[derive(Debug, Clone, Copy)]
struct StagedEntry {
    bucket: BucketId,
    chunk_id: u32,
    lid: u32,
    size: u32,
}

enum StagedData {
    Raw(Vec<u8>),
    Lz4(Vec<u8>),
}

struct SealedChunk {
    seq: u64,
    entries: Vec<StagedEntry>,
    data: StagedData,
    /// Arena bytes this chunk still holds
    reserved: usize,
}

/// A staged entry handed back by `drain`
#[derive(Debug, Clone)]
pub struct StagedItem {
    pub bucket: BucketId,
    /// Chunk of the source file the entry came from
    pub chunk_id: u32,
    pub lid: u32,
    pub payload: Bytes,
}

/// Staging buffer for one shard of the bucket key space
pub struct StoreByBucket {
    arena: Arc<StagingArena>,
    compression: Compression,
    chunk_bytes: usize,

    /// Chunk being filled
    entries: Vec<StagedEntry>,
    data: Vec<u8>,
    reserved: usize,

    /// Sealed chunks; compression tasks push into this
    sealed: Arc<Mutex<Vec<SealedChunk>>>,
    next_seq: u64,
    staged: usize,
}

impl StoreByBucket {
    pub fn new(arena: Arc<StagingArena>, compression: Compression, chunk_bytes: usize) -> Self {
        Self {
            arena,
            compression,
            chunk_bytes,
            entries: Vec::new(),
            data: Vec::new(),
            reserved: 0,
            sealed: Arc::new(Mutex::new(Vec::new())),
            next_seq: 0,
            staged: 0,
        }
    }

    /// Stage one entry
    ///
    /// `reserved` arena bytes were taken by the caller and are released when
    /// the entry is drained. Compression of a sealed chunk is submitted to
    /// `executor` and holds a clone of `pending` until it finishes.
    pub fn add(
        &mut self,
        bucket: BucketId,
        chunk_id: u32,
        lid: u32,
        payload: &[u8],
        reserved: usize,
        executor: &dyn Executor,
        pending: &WaitGroup,
    ) -> Result<()> {
        self.entries.push(StagedEntry {
            bucket,
            chunk_id,
            lid,
            size: payload.len() as u32,
        });
        self.data.extend_from_slice(payload);
        self.reserved += reserved;
        self.staged += 1;

        if self.data.len() >= self.chunk_bytes {
            self.seal(executor, pending)?;
        }
        Ok(())
    }

    /// Entries staged since the last drain
    pub fn len(&self) -> usize {
        self.staged
    }

    pub fn is_empty(&self) -> bool {
        self.staged == 0
    }

    /// Take every staged entry, stably sorted by bucket key
    ///
    /// Compression tasks for this shard must have finished; the caller waits
    /// on the `pending` group first.
    pub fn drain(&mut self) -> Result<Vec<StagedItem>> {
        let mut chunks = std::mem::take(&mut *self.sealed.lock());
        if !self.entries.is_empty() {
            chunks.push(SealedChunk {
                seq: self.next_seq,
                entries: std::mem::take(&mut self.entries),
                data: StagedData::Raw(std::mem::take(&mut self.data)),
                reserved: std::mem::take(&mut self.reserved),
            });
            self.next_seq += 1;
        }
        chunks.sort_by_key(|c| c.seq);

        let mut items = Vec::with_capacity(self.staged);
        for chunk in chunks {
            self.arena.release(chunk.reserved);
            let data = match chunk.data {
                StagedData::Raw(raw) => Bytes::from(raw),
                StagedData::Lz4(compressed) => Bytes::from(
                    lz4_flex::decompress_size_prepended(&compressed)
                        .map_err(|e| StoreError::Compression(e.to_string()))?,
                ),
            };

            let mut pos = 0usize;
            for entry in chunk.entries {
                let end = pos + entry.size as usize;
                if end > data.len() {
                    return Err(StoreError::Compression(format!(
                        "staged chunk holds {} bytes, entries need {}",
                        data.len(),
                        end
                    )));
                }
                items.push(StagedItem {
                    bucket: entry.bucket,
                    chunk_id: entry.chunk_id,
                    lid: entry.lid,
                    payload: data.slice(pos..end),
                });
                pos = end;
            }
        }
        self.staged = 0;

        // Stable: entries for the same bucket keep their scan order
        items.sort_by_key(|item| item.bucket);
        Ok(items)
    }

    fn seal(&mut self, executor: &dyn Executor, pending: &WaitGroup) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entries = std::mem::take(&mut self.entries);
        let raw = std::mem::take(&mut self.data);
        let reserved = std::mem::take(&mut self.reserved);

        match self.compression {
            Compression::None => {
                self.sealed.lock().push(SealedChunk {
                    seq,
                    entries,
                    data: StagedData::Raw(raw),
                    reserved,
                });
                Ok(())
            }
            Compression::Lz4 => {
                let sealed = Arc::clone(&self.sealed);
                let arena = Arc::clone(&self.arena);
                let done = pending.clone();
                executor.execute(Box::new(move || {
                    let compressed = lz4_flex::compress_prepend_size(&raw);
                    let chunk = if compressed.len() < raw.len() {
                        let saved = raw.len() - compressed.len();
                        arena.release(saved);
                        SealedChunk {
                            seq,
                            entries,
                            data: StagedData::Lz4(compressed),
                            reserved: reserved - saved,
                        }
                    } else {
                        SealedChunk {
                            seq,
                            entries,
                            data: StagedData::Raw(raw),
                            reserved,
                        }
                    };
                    sealed.lock().push(chunk);
                    drop(done);
                }))
            }
        }
    }
}

impl std::fmt::Debug for StoreByBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreByBucket")
            .field("staged", &self.staged)
            .field("open_bytes", &self.data.len())
            .field("compression", &self.compression)
            .finish()
    }
}
