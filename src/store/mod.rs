//! Store Module
//!
//! The public read / write / remove surface over a directory of file pairs.
//!
//! ## Responsibilities
//! - Discover file pairs on startup and rebuild the lid table from their
//!   index streams (data streams are not read)
//! - Append writes and tombstones to the single active file
//! - Rotate the active file once it grows past `max_file_size`
//! - Relocate still-live entries during compaction and retire the source
//!   once no reader can reach it
//!
//! ## Locking
//! ```text
//!   lid lock (striped)  ──▶  active pointer (held for the swap only)
//!        │
//!        └──▶ FileChunk writer mutex ──▶ chunk index RwLock
//! ```
//! `layout_lock` serializes file creation (rotation, compaction targets)
//! and is never taken while a lid lock is held.

mod compaction;
mod log_store;

pub use compaction::{CompactionMode, Relocation};
pub use log_store::LogDataStore;
