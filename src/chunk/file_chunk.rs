//! File Chunk
//!
//! One index + data file pair. Frozen pairs are read-only; the active pair
//! also carries a `ChunkWriter`.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::Result;

use super::format::{IndexScan, LidMeta, ScannedChunk};
use super::writer::{ChunkWriter, WriterOptions};
use super::{FileId, NameId, SerialNum};

/// Receives entries while a file is visited
pub trait ChunkVisitor {
    /// Called once per entry in append order; tombstones carry an empty payload
    fn visit(&mut self, chunk_id: u32, lid: u32, payload: &[u8]) -> Result<()>;
}

/// Point-in-time counters for one file pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStats {
    pub file_id: FileId,
    pub name_id: NameId,
    pub writable: bool,
    pub chunks: u64,
    pub entries: u64,
    pub erased_entries: u64,
    pub bytes: u64,
    pub erased_bytes: u64,
    pub last_serial: SerialNum,
}

impl FileStats {
    /// Fraction of payload bytes that are no longer referenced
    pub fn bloat(&self) -> f64 {
        if self.bytes == 0 {
            return if self.entries > 0 && self.erased_entries == self.entries {
                1.0
            } else {
                0.0
            };
        }
        self.erased_bytes as f64 / self.bytes as f64
    }
}

/// An index + data file pair
///
/// ## Concurrency:
/// - `chunks`: RwLock, appended to only while `writer` is locked
/// - `writer`: Mutex; `None` once the pair is frozen
/// - `reader`: Mutex around the read handle (seek + read)
/// - counters: atomics
pub struct FileChunk {
    file_id: FileId,
    name_id: NameId,
    index_path: PathBuf,
    data_path: PathBuf,

    /// Read handle on the data stream
    reader: Mutex<File>,

    /// Sealed chunks; chunk id == position
    chunks: RwLock<Vec<ScannedChunk>>,

    /// Append state, present while the pair is writable
    writer: Mutex<Option<ChunkWriter>>,

    entries: AtomicU64,
    erased_entries: AtomicU64,
    bytes: AtomicU64,
    erased_bytes: AtomicU64,
}

impl FileChunk {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a new, writable file pair
    pub(crate) fn create(
        file_id: FileId,
        dir: &Path,
        name_id: NameId,
        options: WriterOptions,
    ) -> Result<Self> {
        let (index_path, data_path) = Self::paths(dir, name_id);
        let writer = ChunkWriter::create(&index_path, &data_path, name_id, options)?;
        let reader = File::open(&data_path)?;

        tracing::debug!(%file_id, name_id, "created file pair");

        Ok(Self {
            file_id,
            name_id,
            index_path,
            data_path,
            reader: Mutex::new(reader),
            chunks: RwLock::new(Vec::new()),
            writer: Mutex::new(Some(writer)),
            entries: AtomicU64::new(0),
            erased_entries: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            erased_bytes: AtomicU64::new(0),
        })
    }

    /// Open an existing pair by scanning its index stream
    ///
    /// A torn trailing chunk is cut from both streams. Frozen pairs can end
    /// torn as well, since a crash can interrupt a rotation or a compaction
    /// target before it is frozen. `writable` reopens the pair for appending.
    pub(crate) fn open(
        file_id: FileId,
        dir: &Path,
        name_id: NameId,
        writable: Option<WriterOptions>,
    ) -> Result<Self> {
        let (index_path, data_path) = Self::paths(dir, name_id);

        let index_bytes = fs::read(&index_path)?;
        let data_len = fs::metadata(&data_path)?.len();
        let scan = IndexScan::parse(&index_path, &index_bytes, data_len)?;

        if scan.torn_tail || scan.valid_data_len < data_len {
            tracing::warn!(
                %file_id,
                name_id,
                index_len = index_bytes.len(),
                valid_index_len = scan.valid_index_len,
                data_len,
                valid_data_len = scan.valid_data_len,
                "truncating torn chunk"
            );
            OpenOptions::new()
                .write(true)
                .open(&index_path)?
                .set_len(scan.valid_index_len)?;
            OpenOptions::new()
                .write(true)
                .open(&data_path)?
                .set_len(scan.valid_data_len)?;
        }

        let entries = scan.entry_count();
        let bytes: u64 = scan.chunks.iter().map(|c| u64::from(c.meta.size)).sum();
        let last_serial = scan
            .chunks
            .last()
            .map(|c| c.meta.last_serial)
            .unwrap_or(0);

        let writer = match writable {
            Some(options) => Some(ChunkWriter::resume(
                &index_path,
                &data_path,
                scan.chunks.len() as u32,
                last_serial,
                scan.valid_data_len,
                options,
            )?),
            None => None,
        };
        let reader = File::open(&data_path)?;

        tracing::debug!(
            %file_id,
            name_id,
            chunks = scan.chunks.len(),
            entries,
            writable = writer.is_some(),
            "opened file pair"
        );

        Ok(Self {
            file_id,
            name_id,
            index_path,
            data_path,
            reader: Mutex::new(reader),
            chunks: RwLock::new(scan.chunks),
            writer: Mutex::new(writer),
            entries: AtomicU64::new(entries),
            erased_entries: AtomicU64::new(0),
            bytes: AtomicU64::new(bytes),
            erased_bytes: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Append one entry
    ///
    /// Returns the chunk id the entry lives in, or `None` if the pair was
    /// frozen in the meantime and the caller must pick the new active file.
    pub fn append(&self, serial: SerialNum, lid: u32, payload: &[u8]) -> Result<Option<u32>> {
        let mut guard = self.writer.lock();
        let writer = match guard.as_mut() {
            Some(w) => w,
            None => return Ok(None),
        };

        let chunk_id = writer.append(serial, lid, Bytes::copy_from_slice(payload))?;
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);

        if writer.should_seal() {
            if let Some(chunk) = writer.seal()? {
                self.chunks.write().push(chunk);
            }
        }

        Ok(Some(chunk_id))
    }

    /// Write the pending chunk (if any) and sync both streams
    pub fn flush(&self) -> Result<SerialNum> {
        let mut guard = self.writer.lock();
        match guard.as_mut() {
            Some(writer) => {
                if let Some(chunk) = writer.seal()? {
                    self.chunks.write().push(chunk);
                }
                writer.sync()?;
                Ok(writer.last_serial())
            }
            None => Ok(self.sealed_last_serial()),
        }
    }

    /// Flush and drop the writer; the pair becomes read-only
    pub fn freeze(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        if let Some(mut writer) = guard.take() {
            if let Some(chunk) = writer.seal()? {
                self.chunks.write().push(chunk);
            }
            writer.sync()?;
            tracing::debug!(file_id = %self.file_id, name_id = self.name_id, "froze file pair");
        }
        Ok(())
    }

    /// Account for an entry of this file that is no longer referenced
    pub fn note_erased(&self, size: u32) {
        self.erased_entries.fetch_add(1, Ordering::Relaxed);
        self.erased_bytes.fetch_add(u64::from(size), Ordering::Relaxed);
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Read the payload of `lid` from chunk `chunk_id`
    ///
    /// Returns `None` if the chunk holds no entry for the lid.
    pub fn read(&self, chunk_id: u32, lid: u32) -> Result<Option<Bytes>> {
        // Step 1: The pending chunk is only visible through the writer
        {
            let guard = self.writer.lock();
            if let Some(writer) = guard.as_ref() {
                if chunk_id == writer.pending_id() {
                    return Ok(writer.pending_read(chunk_id, lid));
                }
            }
        }

        // Step 2: Locate the entry within the sealed chunk
        let (offset, size) = {
            let chunks = self.chunks.read();
            let chunk = match chunks.get(chunk_id as usize) {
                Some(c) => c,
                None => return Ok(None),
            };
            match Self::locate(&chunk.entries, lid) {
                Some((relative, size)) => (chunk.meta.offset + relative, size),
                None => return Ok(None),
            }
        };

        if size == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Step 3: Read the payload
        let buf = self.read_at(offset, size as usize)?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Visit every entry in append order, including the pending chunk
    ///
    /// An entry followed by another entry for the same lid in the same chunk
    /// is skipped; a chunk id and size alone cannot tell the two apart.
    pub fn visit(&self, visitor: &mut dyn ChunkVisitor) -> Result<()> {
        let mut chunk_id = 0usize;

        loop {
            let sealed = {
                let chunks = self.chunks.read();
                chunks.get(chunk_id).map(|c| (c.meta, c.entries.clone()))
            };

            if let Some((meta, entries)) = sealed {
                let data = self.read_at(meta.offset, meta.size as usize)?;
                let latest = latest_per_lid(entries.iter().map(|e| e.lid));
                let mut pos = 0usize;
                for (entry, is_latest) in entries.iter().zip(latest) {
                    let end = pos + entry.size as usize;
                    if is_latest {
                        visitor.visit(chunk_id as u32, entry.lid, &data[pos..end])?;
                    }
                    pos = end;
                }
                chunk_id += 1;
                continue;
            }

            let pending = self.writer.lock().as_ref().map(|w| w.pending_entries());
            match pending {
                // Sealed while we were reading; pick it up from `chunks`
                Some((pending_id, _)) if pending_id as usize != chunk_id => continue,
                Some((pending_id, entries)) => {
                    let latest = latest_per_lid(entries.iter().map(|(m, _)| m.lid));
                    for ((meta, payload), is_latest) in entries.iter().zip(latest) {
                        if is_latest {
                            visitor.visit(pending_id, meta.lid, payload)?;
                        }
                    }
                }
                None => {}
            }
            return Ok(());
        }
    }

    /// Call `f(chunk_id, meta)` for every indexed entry without touching the
    /// data stream
    pub fn for_each_entry(&self, mut f: impl FnMut(u32, &LidMeta)) {
        let chunks = self.chunks.read();
        for (chunk_id, chunk) in chunks.iter().enumerate() {
            for entry in &chunk.entries {
                f(chunk_id as u32, entry);
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Delete both files from disk
    pub fn erase(&self) -> Result<()> {
        fs::remove_file(&self.index_path)?;
        fs::remove_file(&self.data_path)?;
        tracing::info!(file_id = %self.file_id, name_id = self.name_id, "erased file pair");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn name_id(&self) -> NameId {
        self.name_id
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn is_writable(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Data stream size including buffered bytes
    pub fn data_size(&self) -> u64 {
        match self.writer.lock().as_ref() {
            Some(writer) => writer.data_size(),
            None => self
                .chunks
                .read()
                .last()
                .map(|c| c.meta.offset + u64::from(c.meta.size))
                .unwrap_or(0),
        }
    }

    /// Bytes buffered in the pending chunk
    pub fn pending_bytes(&self) -> usize {
        self.writer
            .lock()
            .as_ref()
            .map(|w| w.pending_bytes())
            .unwrap_or(0)
    }

    /// Highest serial number written to this pair, pending chunk included
    pub fn last_serial(&self) -> SerialNum {
        if let Some(writer) = self.writer.lock().as_ref() {
            return writer.last_serial();
        }
        self.sealed_last_serial()
    }

    fn sealed_last_serial(&self) -> SerialNum {
        self.chunks
            .read()
            .last()
            .map(|c| c.meta.last_serial)
            .unwrap_or(0)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            file_id: self.file_id,
            name_id: self.name_id,
            writable: self.is_writable(),
            chunks: self.chunk_count() as u64,
            entries: self.entries.load(Ordering::Relaxed),
            erased_entries: self.erased_entries.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            erased_bytes: self.erased_bytes.load(Ordering::Relaxed),
            last_serial: self.last_serial(),
        }
    }

    // =========================================================================
    // Path Helpers
    // =========================================================================

    /// Index and data paths for a name id
    /// 42 → ("00000000000000000042.idx", "00000000000000000042.dat")
    pub fn paths(dir: &Path, name_id: NameId) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{:020}.idx", name_id)),
            dir.join(format!("{:020}.dat", name_id)),
        )
    }

    /// Parse a name id from an index file name
    pub fn parse_name_id(path: &Path) -> Option<NameId> {
        if path.extension()? != "idx" {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Relative offset and size of the last entry for `lid` in a chunk
    fn locate(entries: &[LidMeta], lid: u32) -> Option<(u64, u32)> {
        let mut offset = 0u64;
        let mut found = None;
        for entry in entries {
            if entry.lid == lid {
                found = Some((offset, entry.size));
            }
            offset += u64::from(entry.size);
        }
        found
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// `true` for entries not followed by another entry for the same lid
fn latest_per_lid(lids: impl DoubleEndedIterator<Item = u32> + ExactSizeIterator) -> Vec<bool> {
    let mut seen = HashSet::new();
    let mut latest = vec![false; lids.len()];
    for (pos, lid) in lids.enumerate().rev() {
        latest[pos] = seen.insert(lid);
    }
    latest
}

impl std::fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunk")
            .field("file_id", &self.file_id)
            .field("name_id", &self.name_id)
            .field("index_path", &self.index_path)
            .finish()
    }
}
