//! Chunk Module
//!
//! Physical storage: append-only file pairs and their binary format.
//!
//! ## File Pair
//! ```text
//! {name_id}.idx                              {name_id}.dat
//! ┌──────────────────────────────┐           ┌──────────────────────┐
//! │ Header                       │           │ payload lid 7        │
//! │  [len u32][bincode][crc u32] │     ┌────▶│ payload lid 3        │
//! ├──────────────────────────────┤     │     │ payload lid 9        │
//! │ ChunkMeta (24)               │─────┘     ├──────────────────────┤
//! │  last_serial u64             │  offset   │ payload lid 7        │
//! │  num_entries u32             │  + size   │ ...                  │
//! │  offset u64 │ size u32       │           └──────────────────────┘
//! │ LidMeta (8) × num_entries    │
//! │  lid u32 │ size u32          │
//! ├──────────────────────────────┤
//! │ ChunkMeta ...                │
//! └──────────────────────────────┘
//! ```
//!
//! Data bytes of a chunk are written before its index record, so a chunk
//! whose record is present is complete. A torn trailing record is discarded
//! when the file is reopened.

mod file_chunk;
mod format;
mod writer;

use std::fmt;

pub use file_chunk::{ChunkVisitor, FileChunk, FileStats};
pub(crate) use writer::WriterOptions;
pub use format::{
    decode_header, encode_header, ChunkMeta, FileHeader, IndexScan, LidMeta, ScannedChunk,
    CHUNK_META_SIZE, FORMAT_VERSION, LID_META_SIZE, MAGIC, MAX_CHUNK_ENTRIES,
};

/// Identifies one file pair within a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId(pub u32);

impl FileId {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// Orders file pairs on disk; later names win when replaying index files
pub type NameId = u64;

/// Serial number of the feed operation that produced an entry
pub type SerialNum = u64;
