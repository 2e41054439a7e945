//! Crash-consistent persistence of the fast tier's metadata
//!
//! Every persistent structure has two on-disk copies and a selector bit:
//!
//! - the descriptor: two slots, chosen by [`VersionFlags::SUPER`]
//! - the access counters: two copies, chosen by [`VersionFlags::COUNTERS`]
//! - each mapping page: two copies, chosen by its bit in the descriptor's
//!   version map
//!
//! A checkpoint only ever writes the copies that are not authoritative and
//! returns the toggled selector flags. The host commits them in its own
//! checkpoint record, then calls `commit_snapshot` so the next checkpoint
//! alternates again.

mod flags;
mod persist;

pub use flags::VersionFlags;
pub use persist::{format_device, read_descriptor, MetaPersistence};
