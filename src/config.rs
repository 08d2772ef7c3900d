//! Configuration for lidstore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{Result, StoreError};

/// Main configuration for a lidstore instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding all file pairs
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── 00000000000000000001.idx   (index stream)
    ///     ├── 00000000000000000001.dat   (data stream)
    ///     └── ...
    pub data_dir: PathBuf,

    /// Rotate to a new active file once its data stream reaches this size
    pub max_file_size: u64,

    /// Seal and write the pending chunk once it buffers this many payload bytes
    pub max_chunk_bytes: usize,

    /// When to fsync the active file pair
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Ratio of erased to total bytes above which a frozen file is compacted
    pub max_bloat: f64,

    /// Number of significant bits in bucket keys handed out by the bucketizer
    pub max_significant_bucket_bits: u32,

    /// Byte budget shared by all staging shards of a bucket compaction
    pub staging_arena_bytes: usize,

    /// How many staged writes share one bucketizer guard before it is refreshed
    pub bucketizer_guard_refresh: u32,

    /// Compression applied to staged compaction chunks
    pub compression: Compression,

    // -------------------------------------------------------------------------
    // Flush Cost Configuration
    // -------------------------------------------------------------------------
    pub flush_cost: FlushCostConfig,
}

/// Sync strategy for the active file pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every chunk write (safest, slowest)
    EveryChunk,

    /// fsync only on explicit flush and on rotation
    OnFlush,
}

/// Compression for staged compaction chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
}

/// Weights used by the flush cost model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushCostConfig {
    /// Cost per byte of transaction log that must be replayed on restart
    pub tls_replay_byte_cost: f64,

    /// Cost per operation of transaction log that must be replayed on restart
    pub tls_replay_operation_cost: f64,

    /// Cost per byte written to disk when flushing a target
    pub flush_targets_write_cost: f64,
}

impl Default for FlushCostConfig {
    fn default() -> Self {
        Self {
            tls_replay_byte_cost: 1.0,
            tls_replay_operation_cost: 1.0,
            flush_targets_write_cost: 1.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./lidstore_data"),
            max_file_size: 1024 * 1024 * 1024, // 1 GB
            max_chunk_bytes: 64 * 1024,        // 64 KB
            sync_strategy: SyncStrategy::OnFlush,
            max_bloat: 0.5,
            max_significant_bucket_bits: 58,
            staging_arena_bytes: 1024 * 1024 * 1024, // 1 GB
            bucketizer_guard_refresh: 1000,
            compression: Compression::Lz4,
            flush_cost: FlushCostConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the store cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            return Err(StoreError::Config("max_file_size must be > 0".into()));
        }
        if self.max_chunk_bytes == 0 {
            return Err(StoreError::Config("max_chunk_bytes must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.max_bloat) {
            return Err(StoreError::Config(format!(
                "max_bloat must be within [0, 1], got {}",
                self.max_bloat
            )));
        }
        if self.max_significant_bucket_bits > 64 {
            return Err(StoreError::Config(format!(
                "max_significant_bucket_bits must be <= 64, got {}",
                self.max_significant_bucket_bits
            )));
        }
        if self.bucketizer_guard_refresh == 0 {
            return Err(StoreError::Config(
                "bucketizer_guard_refresh must be > 0".into(),
            ));
        }
        if self.staging_arena_bytes == 0 {
            return Err(StoreError::Config("staging_arena_bytes must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the data stream size at which the active file is rotated
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Set the pending chunk size limit (in bytes)
    pub fn max_chunk_bytes(mut self, size: usize) -> Self {
        self.config.max_chunk_bytes = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the bloat ratio that makes a file eligible for compaction
    pub fn max_bloat(mut self, ratio: f64) -> Self {
        self.config.max_bloat = ratio;
        self
    }

    /// Set the number of significant bucket bits
    pub fn max_significant_bucket_bits(mut self, bits: u32) -> Self {
        self.config.max_significant_bucket_bits = bits;
        self
    }

    /// Set the staging arena budget (in bytes)
    pub fn staging_arena_bytes(mut self, bytes: usize) -> Self {
        self.config.staging_arena_bytes = bytes;
        self
    }

    /// Set how many staged writes share one bucketizer guard
    pub fn bucketizer_guard_refresh(mut self, writes: u32) -> Self {
        self.config.bucketizer_guard_refresh = writes;
        self
    }

    /// Set the staging compression
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the flush cost weights
    pub fn flush_cost(mut self, cost: FlushCostConfig) -> Self {
        self.config.flush_cost = cost;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
