//! Block addressing for the two tiers
//!
//! All addresses are block numbers on one of the two devices. The slow tier's
//! main area is divided into `slow_segments` segments starting at
//! `slow_main_blkaddr`; the fast tier's data region holds `fast_segments`
//! segments starting at `main_blkaddr`. Both tiers use the same block size and
//! segment size.

use std::fmt;

/// Device a request is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Primary block device being accelerated
    Slow,
    /// Byte-addressable cache device
    Fast,
}

impl Tier {
    /// Get the tier name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Slow => "slow",
            Tier::Fast => "fast",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved destination of an I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Device to dispatch to
    pub tier: Tier,
    /// Block number on that device
    pub block: u64,
}

impl Target {
    /// Target on the slow tier
    pub const fn slow(block: u64) -> Self {
        Self {
            tier: Tier::Slow,
            block,
        }
    }

    /// Target on the fast tier
    pub const fn fast(block: u64) -> Self {
        Self {
            tier: Tier::Fast,
            block,
        }
    }

    /// Check whether the request was moved to the fast tier
    pub const fn is_fast(&self) -> bool {
        matches!(self.tier, Tier::Fast)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.block)
    }
}

/// Block layout of the fast tier plus the slow-tier geometry it caches.
///
/// Built at format time and recovered from the super-descriptor at mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Block size in bytes (shared by both tiers)
    pub block_size: u32,
    /// Blocks per segment (shared by both tiers)
    pub blocks_per_segment: u32,
    /// Number of fast-tier data segments (N)
    pub fast_segments: u32,
    /// Number of slow-tier main-area segments (M)
    pub slow_segments: u32,
    /// First block of the slow tier's main area
    pub slow_main_blkaddr: u64,
    /// First block of the mirrored metadata range
    pub meta_start: u64,
    /// One past the last block of the mirrored metadata range
    pub meta_end: u64,
    /// First block of mapping copy A; copy B follows after `mpt_pages`
    pub mpt_blkaddr: u64,
    /// Blocks per mapping copy
    pub mpt_pages: u32,
    /// First block of each counter copy
    pub counter_blkaddr: [u64; 2],
    /// Blocks per counter copy
    pub counter_pages: u32,
    /// First block of the fast data region
    pub main_blkaddr: u64,
}

impl Layout {
    /// Bytes per segment
    #[inline]
    pub const fn segment_bytes(&self) -> u64 {
        self.block_size as u64 * self.blocks_per_segment as u64
    }

    /// Mapping entries stored in one block
    #[inline]
    pub const fn entries_per_page(&self) -> u32 {
        self.block_size / 4
    }

    /// Total mapping entries (N + M)
    #[inline]
    pub const fn mpt_entries(&self) -> u32 {
        self.fast_segments + self.slow_segments
    }

    /// Byte offset of a block on either device
    #[inline]
    pub const fn byte_offset(&self, block: u64) -> u64 {
        block * self.block_size as u64
    }

    /// Block of mapping page `page` in copy `version` (0 = A, 1 = B)
    #[inline]
    pub const fn mpt_page_block(&self, page: u32, version: bool) -> u64 {
        let base = self.mpt_blkaddr + page as u64;
        if version {
            base + self.mpt_pages as u64
        } else {
            base
        }
    }

    /// First block of counter copy `copy`
    #[inline]
    pub const fn counter_block(&self, copy: bool) -> u64 {
        if copy {
            self.counter_blkaddr[1]
        } else {
            self.counter_blkaddr[0]
        }
    }

    /// First fast-tier block of fast segment `segment`
    #[inline]
    pub const fn fast_segment_start(&self, segment: u32) -> u64 {
        self.main_blkaddr + segment as u64 * self.blocks_per_segment as u64
    }

    /// First slow-tier block of slow segment `segment`
    #[inline]
    pub const fn slow_segment_start(&self, segment: u32) -> u64 {
        self.slow_main_blkaddr + segment as u64 * self.blocks_per_segment as u64
    }

    /// Fast-tier block for `offset` within fast segment `segment`
    #[inline]
    pub const fn fast_block(&self, segment: u32, offset: u32) -> u64 {
        self.fast_segment_start(segment) + offset as u64
    }

    /// Check whether a slow-tier block lies in the mirrored metadata range
    #[inline]
    pub const fn is_meta_block(&self, block: u64) -> bool {
        block >= self.meta_start && block < self.meta_end
    }

    /// Split a slow-tier main-area block into `(segment, offset)`.
    ///
    /// Returns `None` for blocks outside the main area.
    pub fn slow_segment_of(&self, block: u64) -> Option<(u32, u32)> {
        if block < self.slow_main_blkaddr {
            return None;
        }
        let rel = block - self.slow_main_blkaddr;
        let bps = self.blocks_per_segment as u64;
        let segment = rel / bps;
        if segment >= self.slow_segments as u64 {
            return None;
        }
        Some((segment as u32, (rel % bps) as u32))
    }

    /// Size in bytes the fast device must have for this layout
    pub const fn fast_device_bytes(&self) -> u64 {
        self.byte_offset(self.fast_segment_start(self.fast_segments))
    }
}
