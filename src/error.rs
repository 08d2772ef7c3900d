//! Error types for lidstore
//!
//! Provides a unified error type for all operations.
//!
//! Reads of missing or removed lids are not errors; they return `Ok(None)`.
//! Liveness mismatches during a compaction drain are not errors either.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for lidstore operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // On-disk Format Errors
    // -------------------------------------------------------------------------
    /// An index file held an inconsistent chunk; the store refuses to open.
    #[error(
        "Corrupt chunk in {path:?} after {chunks_parsed} chunks / {entries_parsed} entries: {reason}"
    )]
    CorruptChunk {
        path: PathBuf,
        chunks_parsed: u64,
        entries_parsed: u64,
        reason: String,
    },

    #[error("Invalid file header in {path:?}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    // -------------------------------------------------------------------------
    // Store Errors
    // -------------------------------------------------------------------------
    #[error("Unknown file id: {0}")]
    UnknownFile(u32),

    #[error("File id space exhausted (max {0})")]
    FileIdExhausted(u32),

    #[error("Lid {lid} out of range (limit {limit})")]
    LidOutOfRange { lid: u32, limit: u32 },

    #[error("Chunk id {0} exceeds the addressable chunk range")]
    ChunkIdOverflow(u32),

    #[error("File {0} is writable and cannot be a compaction source")]
    WritableSource(u32),

    #[error("Compaction target {0} was frozen before the pass finished")]
    FrozenTarget(u32),

    #[error("Writer failed on an earlier write; reopen the store")]
    WriterFailed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Background Work Errors
    // -------------------------------------------------------------------------
    #[error("Executor error: {0}")]
    Executor(String),
}
