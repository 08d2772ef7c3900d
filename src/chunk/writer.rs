//! Chunk Writer
//!
//! Append state of a writable file pair: the pending chunk and the two
//! file handles it is eventually written to.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::config::SyncStrategy;
use crate::error::{Result, StoreError};

use super::format::{
    encode_header, ChunkMeta, FileHeader, LidMeta, ScannedChunk, CHUNK_META_SIZE, LID_META_SIZE,
    MAX_CHUNK_ENTRIES,
};
use super::{NameId, SerialNum};

/// Largest chunk id addressable by a packed LidInfo
pub(crate) const MAX_CHUNK_ID: u32 = (1 << 22) - 1;

/// Options shared by every writable file of a store
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriterOptions {
    pub sync: SyncStrategy,
    pub max_chunk_bytes: usize,
}

/// Entries buffered for the next chunk
#[derive(Debug, Default)]
struct PendingChunk {
    id: u32,
    entries: Vec<(LidMeta, Bytes)>,
    bytes: usize,
    last_serial: SerialNum,
}

impl PendingChunk {
    fn find(&self, lid: u32) -> Option<&Bytes> {
        self.entries
            .iter()
            .rev()
            .find(|(meta, _)| meta.lid == lid)
            .map(|(_, payload)| payload)
    }
}

/// Writer side of an active file pair
pub(crate) struct ChunkWriter {
    index: File,
    data: File,
    pending: PendingChunk,
    /// Bytes already written to the data stream
    data_len: u64,
    options: WriterOptions,
    /// Set once a write or sync failed; the streams may disagree after that
    failed: bool,
}

impl ChunkWriter {
    /// Create a fresh file pair and write the index header
    pub fn create(
        index_path: &Path,
        data_path: &Path,
        name_id: NameId,
        options: WriterOptions,
    ) -> Result<Self> {
        let mut index = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(index_path)?;
        let data = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(data_path)?;

        index.write_all(&encode_header(&FileHeader::new(name_id))?)?;
        index.sync_all()?;

        Ok(Self {
            index,
            data,
            pending: PendingChunk::default(),
            data_len: 0,
            options,
            failed: false,
        })
    }

    /// Reopen an existing pair for appending
    ///
    /// The caller has already truncated any torn tail, so both files end on
    /// a chunk boundary.
    pub fn resume(
        index_path: &Path,
        data_path: &Path,
        next_chunk_id: u32,
        last_serial: SerialNum,
        data_len: u64,
        options: WriterOptions,
    ) -> Result<Self> {
        let index = OpenOptions::new().append(true).open(index_path)?;
        let data = OpenOptions::new().append(true).open(data_path)?;

        Ok(Self {
            index,
            data,
            pending: PendingChunk {
                id: next_chunk_id,
                last_serial,
                ..PendingChunk::default()
            },
            data_len,
            options,
            failed: false,
        })
    }

    /// Buffer one entry and return the chunk id it will be written under
    pub fn append(&mut self, serial: SerialNum, lid: u32, payload: Bytes) -> Result<u32> {
        self.check_usable()?;
        if self.pending.id > MAX_CHUNK_ID {
            return Err(StoreError::ChunkIdOverflow(self.pending.id));
        }

        let size = u32::try_from(payload.len()).map_err(|_| {
            StoreError::Config(format!("payload of {} bytes exceeds u32", payload.len()))
        })?;

        self.pending.bytes += payload.len();
        self.pending.last_serial = self.pending.last_serial.max(serial);
        self.pending.entries.push((LidMeta { lid, size }, payload));
        Ok(self.pending.id)
    }

    pub fn should_seal(&self) -> bool {
        self.pending.bytes >= self.options.max_chunk_bytes
            || self.pending.entries.len() >= MAX_CHUNK_ENTRIES as usize
    }

    pub fn pending_id(&self) -> u32 {
        self.pending.id
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.bytes
    }

    /// Data stream size including the pending chunk
    pub fn data_size(&self) -> u64 {
        self.data_len + self.pending.bytes as u64
    }

    pub fn last_serial(&self) -> SerialNum {
        self.pending.last_serial
    }

    /// Payload of `lid` if it sits in the pending chunk `chunk_id`
    pub fn pending_read(&self, chunk_id: u32, lid: u32) -> Option<Bytes> {
        if chunk_id != self.pending.id {
            return None;
        }
        self.pending.find(lid).cloned()
    }

    /// Snapshot of the pending entries, in append order
    pub fn pending_entries(&self) -> (u32, Vec<(LidMeta, Bytes)>) {
        (self.pending.id, self.pending.entries.clone())
    }

    /// Write the pending chunk: payload first, then its index record
    ///
    /// Returns the chunk as it now exists on disk, or `None` when nothing
    /// was pending. Any I/O failure leaves the writer failed: the data
    /// stream may already hold bytes no index record points at.
    pub fn seal(&mut self) -> Result<Option<ScannedChunk>> {
        self.check_usable()?;
        if self.pending.entries.is_empty() {
            return Ok(None);
        }
        let sealed = self.write_pending();
        self.failed = sealed.is_err();
        sealed.map(Some)
    }

    fn write_pending(&mut self) -> Result<ScannedChunk> {
        let size = u32::try_from(self.pending.bytes).map_err(|_| {
            StoreError::Config(format!("chunk of {} bytes exceeds u32", self.pending.bytes))
        })?;

        // Step 1: Payload bytes
        let mut payload = BytesMut::with_capacity(self.pending.bytes);
        for (_, bytes) in &self.pending.entries {
            payload.extend_from_slice(bytes);
        }
        self.data.write_all(&payload)?;
        if self.options.sync == SyncStrategy::EveryChunk {
            self.data.sync_data()?;
        }

        // Step 2: Index record
        let meta = ChunkMeta {
            last_serial: self.pending.last_serial,
            num_entries: self.pending.entries.len() as u32,
            offset: self.data_len,
            size,
        };
        let entries: Vec<LidMeta> = self.pending.entries.iter().map(|(m, _)| *m).collect();

        let mut record = Vec::with_capacity(CHUNK_META_SIZE + entries.len() * LID_META_SIZE);
        meta.encode_into(&mut record);
        for entry in &entries {
            entry.encode_into(&mut record);
        }
        self.index.write_all(&record)?;
        if self.options.sync == SyncStrategy::EveryChunk {
            self.index.sync_data()?;
        }

        // Step 3: Start the next chunk
        self.data_len += u64::from(size);
        self.pending = PendingChunk {
            id: self.pending.id + 1,
            last_serial: self.pending.last_serial,
            ..PendingChunk::default()
        };

        Ok(ScannedChunk { meta, entries })
    }

    pub fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        let synced = self
            .data
            .sync_all()
            .and_then(|()| self.index.sync_all());
        if synced.is_err() {
            self.failed = true;
        }
        synced.map_err(StoreError::from)
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(StoreError::WriterFailed);
        }
        Ok(())
    }
}
