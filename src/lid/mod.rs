//! Lid Module
//!
//! In-memory map from lid to the authoritative location of its entry.
//!
//! ## Responsibilities
//! - Pack (file, chunk, size) into one atomic word per lid
//! - Grow without blocking readers, retiring old arrays through the
//!   generation handler
//! - Serialize per-lid mutation through a striped lock set

mod info;
mod locks;
mod table;

pub use info::LidInfo;
pub use locks::{LidGuard, LidLocks};
pub use table::{LidSnapshot, LidTable};
