//! Generation Module
//!
//! Epoch-based reclamation for state shared between readers and writers.
//!
//! ## Protocol
//! ```text
//!   writer                                  reader
//!   ──────                                  ──────
//!   publish new state                       guard = handler.acquire()
//!   hold_list.hold(current, old_state)      read published state
//!   handler.increment_generation()          ...
//!   oldest = update_oldest_used()           drop(guard)
//!   hold_list.reclaim(oldest)
//! ```
//!
//! Retired state tagged with generation `g` is freed only once every guard
//! pinned at `g` or earlier has been dropped, so a reader never observes
//! freed memory while writers never wait for readers.

mod handler;
mod hold_list;

pub use handler::{GenerationGuard, GenerationHandler};
pub use hold_list::GenerationHoldList;

/// Monotonically increasing epoch counter value
pub type Generation = u64;
