//! Segment mapping table
//!
//! A single array of `N + M` entries: indices `[0, N)` describe fast-tier
//! segments, `[N, N + M)` describe slow-tier segments. A mapped pair points at
//! each other with identical redirect flags.

mod entry;
mod table;

pub use entry::{MappingEntry, RedirectFlags};
pub use table::{DirtyPage, MappingTable};
