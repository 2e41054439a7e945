//! Format-time geometry and layout computation

use uuid::Uuid;

use crate::address::Layout;
use crate::bitmap::Bitmap;
use crate::format::SuperDescriptor;
use crate::status::{NvmError, Result};

/// Geometry for formatting a fast tier against a slow tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// Block size shared by both tiers
    pub block_size: u32,
    /// Blocks per segment shared by both tiers
    pub blocks_per_segment: u32,
    /// Number of fast-tier data segments
    pub fast_segments: u32,
    /// Number of slow-tier main-area segments
    pub slow_segments: u32,
    /// First block of the slow tier's main area
    pub slow_main_blkaddr: u64,
    /// First slow-tier metadata block mirrored on the fast tier
    pub meta_start: u64,
    /// One past the last mirrored metadata block
    pub meta_end: u64,
    /// Identity of the slow tier
    pub identity: Uuid,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_per_segment: 512,
            fast_segments: 0,
            slow_segments: 0,
            slow_main_blkaddr: 0,
            meta_start: 2,
            meta_end: 2,
            identity: Uuid::nil(),
        }
    }
}

impl FormatOptions {
    /// Create options for `fast_segments` cache segments over `slow_segments`
    pub fn new(fast_segments: u32, slow_segments: u32) -> Self {
        Self {
            fast_segments,
            slow_segments,
            ..Self::default()
        }
    }

    /// Set block size
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set blocks per segment
    pub fn with_blocks_per_segment(mut self, blocks: u32) -> Self {
        self.blocks_per_segment = blocks;
        self
    }

    /// Set the slow tier's main-area start block
    pub fn with_slow_main_blkaddr(mut self, blkaddr: u64) -> Self {
        self.slow_main_blkaddr = blkaddr;
        self
    }

    /// Set the mirrored metadata range
    pub fn with_meta_range(mut self, start: u64, end: u64) -> Self {
        self.meta_start = start;
        self.meta_end = end;
        self
    }

    /// Set the slow tier identity
    pub fn with_identity(mut self, identity: Uuid) -> Self {
        self.identity = identity;
        self
    }

    /// Compute the fast-tier layout.
    ///
    /// Rejects geometries whose metadata mirror overlaps the descriptor slots,
    /// whose descriptor does not fit one block, or whose segments cannot be
    /// split into two equal halves.
    pub fn layout(&self) -> Result<Layout> {
        let bs = self.block_size;
        if bs < 512 || !bs.is_power_of_two() {
            return Err(NvmError::InvalidGeometry(format!(
                "block size {bs} must be a power of two >= 512"
            )));
        }
        let bps = self.blocks_per_segment;
        if bps < 2 || bps % 2 != 0 {
            return Err(NvmError::InvalidGeometry(format!(
                "blocks per segment {bps} must be even"
            )));
        }
        if self.fast_segments == 0 || self.slow_segments == 0 {
            return Err(NvmError::InvalidGeometry("segment counts must be non-zero".into()));
        }
        if self.fast_segments as u64 + self.slow_segments as u64 > MAX_ENTRIES {
            return Err(NvmError::InvalidGeometry("too many segments".into()));
        }
        if self.meta_start < 2 {
            return Err(NvmError::InvalidGeometry(format!(
                "metadata range starting at {} overlaps the descriptor slots",
                self.meta_start
            )));
        }
        if self.meta_end < self.meta_start || self.meta_end > self.slow_main_blkaddr {
            return Err(NvmError::InvalidGeometry(format!(
                "metadata range {}..{} invalid for main area at {}",
                self.meta_start, self.meta_end, self.slow_main_blkaddr
            )));
        }

        let entries = self.fast_segments + self.slow_segments;
        let mpt_pages = entries.div_ceil(bs / 4);
        let counter_pages = (self.fast_segments as u64 * 4).div_ceil(bs as u64) as u32;

        let mpt_blkaddr = self.meta_end;
        let counter0 = mpt_blkaddr + 2 * mpt_pages as u64;
        let counter1 = counter0 + counter_pages as u64;
        let main_blkaddr = (counter1 + counter_pages as u64).div_ceil(bps as u64) * bps as u64;

        let layout = Layout {
            block_size: bs,
            blocks_per_segment: bps,
            fast_segments: self.fast_segments,
            slow_segments: self.slow_segments,
            slow_main_blkaddr: self.slow_main_blkaddr,
            meta_start: self.meta_start,
            meta_end: self.meta_end,
            mpt_blkaddr,
            mpt_pages,
            counter_blkaddr: [counter0, counter1],
            counter_pages,
            main_blkaddr,
        };

        let needed = SuperDescriptor::encoded_len(&layout);
        if needed > bs as usize {
            return Err(NvmError::InvalidGeometry(format!(
                "descriptor needs {needed} bytes ({} + {} bitmap bytes), block is {bs}",
                SuperDescriptor::HEADER_SIZE,
                Bitmap::byte_len(mpt_pages as usize) + Bitmap::byte_len(self.fast_segments as usize)
            )));
        }
        Ok(layout)
    }
}

/// Entries addressable by a packed mapping word
const MAX_ENTRIES: u64 = 1 << 30;
