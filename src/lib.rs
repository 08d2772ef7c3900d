//! # lidstore
//!
//! An append-only, log-structured document store addressed by dense local
//! ids (lids), with:
//! - An index stream / data stream file format with atomic chunks
//! - Generation-based reclamation so readers never block on writers
//! - Background compaction that re-validates liveness under per-lid locks
//! - A flush cost model for choosing what to persist before a restart
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LogDataStore                           │
//! │          write / remove / read / visit / compact             │
//! └───────┬──────────────────────┬──────────────────────┬───────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐       ┌──────────────┐       ┌──────────────┐
//!  │  LidTable   │       │  FileChunk   │       │  Compacter   │
//!  │ lid → info  │       │ .idx + .dat  │       │ BucketCompa- │
//!  │ (per-lid    │       │ (active one  │       │ cter (256    │
//!  │  locks)     │       │  writable)   │       │  shards)     │
//!  └──────┬──────┘       └──────────────┘       └──────────────┘
//!         │
//!         ▼
//!  ┌─────────────────┐        ┌──────────────────────────────┐
//!  │GenerationHandler│        │  PrepareRestartFlushStrategy │
//!  │ guards + holds  │        │  write cost vs replay cost   │
//!  └─────────────────┘        └──────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod generation;
pub mod chunk;
pub mod lid;
pub mod store;
pub mod compact;
pub mod flush;

pub mod bucketizer;
pub mod executor;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StoreError};
pub use config::{Compression, Config, FlushCostConfig, SyncStrategy};
pub use store::{CompactionMode, LogDataStore, Relocation};
pub use compact::{CompactionStats, Destination};
pub use bucketizer::{BucketId, Bucketizer, MapBucketizer};
pub use executor::{Executor, InlineExecutor, ThreadPoolExecutor};
pub use generation::{GenerationGuard, GenerationHandler};
pub use lid::LidInfo;
pub use chunk::FileId;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of lidstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
