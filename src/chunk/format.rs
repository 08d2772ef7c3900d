//! Chunk Format
//!
//! Fixed-width index records and the index stream scanner.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

use super::{NameId, SerialNum};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying a lidstore index file
pub const MAGIC: [u8; 4] = *b"LDIX";

/// Current index format version
pub const FORMAT_VERSION: u16 = 1;

/// ChunkMeta: last_serial (8) + num_entries (4) + offset (8) + size (4)
pub const CHUNK_META_SIZE: usize = 24;

/// LidMeta: lid (4) + size (4)
pub const LID_META_SIZE: usize = 8;

/// Header framing: length prefix (4) + trailing CRC (4)
const HEADER_FRAMING: usize = 8;

/// Most entries a writer puts in one chunk
pub const MAX_CHUNK_ENTRIES: u32 = 1 << 16;

// =============================================================================
// Records
// =============================================================================

/// Header of one atomically appended batch of entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMeta {
    pub last_serial: SerialNum,
    pub num_entries: u32,
    /// Offset of the chunk's first payload byte in the data stream
    pub offset: u64,
    /// Total payload bytes of the chunk
    pub size: u32,
}

impl ChunkMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.last_serial.to_le_bytes());
        buf.extend_from_slice(&self.num_entries.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
    }

    /// Decode from exactly `CHUNK_META_SIZE` bytes
    pub fn decode(bytes: &[u8; CHUNK_META_SIZE]) -> Self {
        let mut u64_at = [0u8; 8];
        let mut u32_at = [0u8; 4];

        u64_at.copy_from_slice(&bytes[0..8]);
        let last_serial = u64::from_le_bytes(u64_at);
        u32_at.copy_from_slice(&bytes[8..12]);
        let num_entries = u32::from_le_bytes(u32_at);
        u64_at.copy_from_slice(&bytes[12..20]);
        let offset = u64::from_le_bytes(u64_at);
        u32_at.copy_from_slice(&bytes[20..24]);
        let size = u32::from_le_bytes(u32_at);

        Self {
            last_serial,
            num_entries,
            offset,
            size,
        }
    }
}

/// Per-entry header in the index stream; `size == 0` is a tombstone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LidMeta {
    pub lid: u32,
    pub size: u32,
}

impl LidMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.lid.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(bytes: &[u8; LID_META_SIZE]) -> Self {
        let mut lid = [0u8; 4];
        let mut size = [0u8; 4];
        lid.copy_from_slice(&bytes[0..4]);
        size.copy_from_slice(&bytes[4..8]);
        Self {
            lid: u32::from_le_bytes(lid),
            size: u32::from_le_bytes(size),
        }
    }
}

// =============================================================================
// File Header
// =============================================================================

/// Index file header, bincode encoded inside a length + CRC frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub name_id: NameId,
}

impl FileHeader {
    pub fn new(name_id: NameId) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            name_id,
        }
    }
}

/// Encode a header frame: [len u32][bincode body][crc32(body) u32]
pub fn encode_header(header: &FileHeader) -> Result<Vec<u8>> {
    let body = bincode::serialize(header)?;
    let mut out = Vec::with_capacity(body.len() + HEADER_FRAMING);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(out)
}

/// Decode a header frame from the start of `bytes`
///
/// Returns the header and the number of bytes it occupies.
pub fn decode_header(path: &Path, bytes: &[u8]) -> Result<(FileHeader, usize)> {
    let invalid = |reason: String| StoreError::InvalidHeader {
        path: path.to_path_buf(),
        reason,
    };

    let len_bytes: [u8; 4] = bytes
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid("file shorter than header length prefix".into()))?;
    let body_len = u32::from_le_bytes(len_bytes) as usize;
    let total = body_len + HEADER_FRAMING;

    let body = bytes
        .get(4..4 + body_len)
        .ok_or_else(|| invalid(format!("truncated header body ({} bytes)", body_len)))?;
    let crc_bytes: [u8; 4] = bytes
        .get(4 + body_len..total)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid("missing header checksum".into()))?;

    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(invalid(format!(
            "header checksum mismatch: stored {:08x}, computed {:08x}",
            expected, actual
        )));
    }

    let header: FileHeader = bincode::deserialize(body)?;
    if header.magic != MAGIC {
        return Err(invalid(format!("bad magic {:?}", header.magic)));
    }
    if header.version != FORMAT_VERSION {
        return Err(invalid(format!("unsupported version {}", header.version)));
    }

    Ok((header, total))
}

// =============================================================================
// Index Scanner
// =============================================================================

/// One chunk recovered from an index stream
#[derive(Debug, Clone)]
pub struct ScannedChunk {
    pub meta: ChunkMeta,
    pub entries: Vec<LidMeta>,
}

/// Result of scanning a whole index stream
#[derive(Debug)]
pub struct IndexScan {
    pub header: FileHeader,
    pub header_len: usize,
    pub chunks: Vec<ScannedChunk>,
    /// Index bytes covered by the header and complete chunks
    pub valid_index_len: u64,
    /// Data bytes referenced by complete chunks
    pub valid_data_len: u64,
    /// Whether a torn trailing chunk was discarded
    pub torn_tail: bool,
}

impl IndexScan {
    /// Parse an index stream
    ///
    /// `data_len` is the current length of the matching data stream; a final
    /// chunk whose payload is not fully present is treated as torn.
    ///
    /// Fails with `CorruptChunk` on records that cannot have been produced by
    /// a correct writer: an entry count of zero or above `MAX_CHUNK_ENTRIES`,
    /// an offset that does not continue the previous chunk, entry sizes that
    /// do not add up to the chunk size, or missing payload behind a chunk
    /// that is followed by further chunks. Only a trailing record that passes
    /// these checks as far as it reaches is treated as torn.
    pub fn parse(path: &Path, bytes: &[u8], data_len: u64) -> Result<Self> {
        let (header, header_len) = decode_header(path, bytes)?;

        let mut chunks: Vec<ScannedChunk> = Vec::new();
        let mut entries_parsed: u64 = 0;
        let mut expected_offset: u64 = 0;
        let mut pos = header_len;
        let mut torn_tail = false;

        let corrupt = |chunks: usize, entries: u64, reason: String| StoreError::CorruptChunk {
            path: path.to_path_buf(),
            chunks_parsed: chunks as u64,
            entries_parsed: entries,
            reason,
        };

        while pos < bytes.len() {
            // A crash can leave a zero-filled tail behind the last record
            if bytes[pos..].iter().all(|b| *b == 0) {
                torn_tail = true;
                break;
            }

            // Step 1: Chunk header
            let meta_bytes: &[u8; CHUNK_META_SIZE] =
                match bytes.get(pos..pos + CHUNK_META_SIZE).and_then(|b| b.try_into().ok()) {
                    Some(b) => b,
                    None => {
                        torn_tail = true;
                        break;
                    }
                };
            let meta = ChunkMeta::decode(meta_bytes);
            let entries_start = pos + CHUNK_META_SIZE;
            let entries_len = meta.num_entries as usize * LID_META_SIZE;
            let chunk_end = entries_start + entries_len;

            // Step 2: Header consistency, checked before a record may count as torn
            if meta.num_entries == 0 || meta.num_entries > MAX_CHUNK_ENTRIES {
                return Err(corrupt(
                    chunks.len(),
                    entries_parsed,
                    format!("chunk holds {} entries", meta.num_entries),
                ));
            }
            if meta.offset != expected_offset {
                return Err(corrupt(
                    chunks.len(),
                    entries_parsed,
                    format!(
                        "chunk offset {} does not continue data stream at {}",
                        meta.offset, expected_offset
                    ),
                ));
            }

            // Step 3: Entries; a cut-off record must still add up so far
            let available = chunk_end.min(bytes.len());
            let mut entries = Vec::with_capacity(meta.num_entries as usize);
            let mut total: u64 = 0;
            for raw in bytes[entries_start..available].chunks_exact(LID_META_SIZE) {
                let raw: &[u8; LID_META_SIZE] = raw
                    .try_into()
                    .map_err(|_| corrupt(chunks.len(), entries_parsed, "short lid meta".into()))?;
                let entry = LidMeta::decode(raw);
                total += u64::from(entry.size);
                entries.push(entry);
            }

            if total > u64::from(meta.size) {
                return Err(corrupt(
                    chunks.len(),
                    entries_parsed,
                    format!(
                        "entry sizes reach {} but chunk size is {}",
                        total, meta.size
                    ),
                ));
            }
            if chunk_end > bytes.len() {
                torn_tail = true;
                break;
            }
            if total != u64::from(meta.size) {
                return Err(corrupt(
                    chunks.len(),
                    entries_parsed,
                    format!(
                        "entry sizes sum to {} but chunk size is {}",
                        total, meta.size
                    ),
                ));
            }

            // Step 4: Payload presence
            let data_end = meta.offset + u64::from(meta.size);
            if data_end > data_len {
                if chunk_end == bytes.len() {
                    torn_tail = true;
                    break;
                }
                return Err(corrupt(
                    chunks.len(),
                    entries_parsed,
                    format!(
                        "chunk payload ends at {} beyond data stream length {}",
                        data_end, data_len
                    ),
                ));
            }

            entries_parsed += u64::from(meta.num_entries);
            expected_offset = data_end;
            chunks.push(ScannedChunk { meta, entries });
            pos = chunk_end;
        }

        Ok(Self {
            header,
            header_len,
            chunks,
            valid_index_len: pos as u64,
            valid_data_len: expected_offset,
            torn_tail,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.meta.num_entries)).sum()
    }
}
