//! Boundary to the host filesystem
//!
//! The cache does not own the slow tier's space management. Whether a slow
//! segment is in use, how many of its blocks are live, and how to reclaim a
//! mostly-empty segment are answered by the host through [`HostFilesystem`].

use std::fmt;

use crate::status::Result;

/// Urgency of a reclamation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    /// Caller is blocked on free space; success is counted per section
    Foreground,
    /// Opportunistic pass from the background worker
    Background,
}

impl GcMode {
    /// Get the mode name
    pub const fn as_str(&self) -> &'static str {
        match self {
            GcMode::Foreground => "foreground",
            GcMode::Background => "background",
        }
    }
}

impl fmt::Display for GcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Services the host filesystem provides to the cache
pub trait HostFilesystem: Send + Sync + 'static {
    /// Check whether slow segment `slow` is an open log head or otherwise
    /// must not be moved right now
    fn is_segment_busy(&self, slow: u32) -> bool;

    /// Number of live blocks in slow segment `slow`
    fn valid_blocks(&self, slow: u32) -> u32;

    /// Reclaim slow segment `slow` with the host's own collector.
    ///
    /// Returns the number of segments freed. The host is expected to call
    /// back into `release_slow_segment` for every slow segment it frees.
    fn reclaim_segment(&self, slow: u32, mode: GcMode) -> Result<u32>;

    /// Number of segments the host will free at its next checkpoint
    fn prefree_segments(&self) -> u32 {
        0
    }

    /// Ask the host to write a checkpoint now
    fn write_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    /// Check whether the host is frozen for writes
    fn is_frozen(&self) -> bool {
        false
    }
}
