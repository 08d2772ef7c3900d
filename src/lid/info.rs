//! Packed lid location

use std::fmt;

use crate::chunk::FileId;
use crate::error::{Result, StoreError};

const FILE_ID_BITS: u32 = 10;
const CHUNK_ID_BITS: u32 = 22;
const SIZE_BITS: u32 = 32;

/// Location of the live entry for one lid
///
/// Layout (high → low): file id (10) | chunk id (22) | size (32).
/// `size == 0` means the lid is removed or was never written.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LidInfo(u64);

impl LidInfo {
    pub const MAX_FILE_ID: u32 = (1 << FILE_ID_BITS) - 1;
    pub const MAX_CHUNK_ID: u32 = (1 << CHUNK_ID_BITS) - 1;

    pub fn new(file_id: FileId, chunk_id: u32, size: u32) -> Result<Self> {
        if file_id.0 > Self::MAX_FILE_ID {
            return Err(StoreError::FileIdExhausted(Self::MAX_FILE_ID));
        }
        if chunk_id > Self::MAX_CHUNK_ID {
            return Err(StoreError::ChunkIdOverflow(chunk_id));
        }
        Ok(Self(
            (u64::from(file_id.0) << (CHUNK_ID_BITS + SIZE_BITS))
                | (u64::from(chunk_id) << SIZE_BITS)
                | u64::from(size),
        ))
    }

    pub fn file_id(self) -> FileId {
        FileId((self.0 >> (CHUNK_ID_BITS + SIZE_BITS)) as u32)
    }

    pub fn chunk_id(self) -> u32 {
        ((self.0 >> SIZE_BITS) as u32) & Self::MAX_CHUNK_ID
    }

    pub fn size(self) -> u32 {
        self.0 as u32
    }

    /// Removed or never written
    pub fn is_empty(self) -> bool {
        self.size() == 0
    }

    /// Never written, or pruned after compaction
    pub fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for LidInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LidInfo")
            .field("file_id", &self.file_id().0)
            .field("chunk_id", &self.chunk_id())
            .field("size", &self.size())
            .finish()
    }
}
