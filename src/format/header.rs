//! Super-descriptor encoding
//!
//! The descriptor occupies one block: a fixed little-endian header, then the
//! mapping version bitmap, then the segment allocation bitmap. A XOR checksum
//! over the whole block (checksum field zeroed) guards against torn writes.

use std::fmt;
use std::mem;

use bytemuck::{Pod, Zeroable};
use uuid::Uuid;

use crate::address::Layout;
use crate::bitmap::Bitmap;
use crate::format::FormatOptions;
use crate::status::{NvmError, Result};

/// Format magic numbers
pub mod magic {
    /// nvmtier descriptor (version 1)
    pub const NVMTIER1: [u8; 8] = *b"NVMTIER1";
}

/// Current descriptor format version
pub const FORMAT_VERSION: u32 = 1;

/// Descriptor flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorFlags(u32);

impl DescriptorFlags {
    /// The metadata mirror has not been filled from the slow tier yet
    pub const NEEDS_META_RELOAD: u32 = 1 << 0;

    /// Create flags from raw bits
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// No flags
    pub fn empty() -> Self {
        Self(0)
    }

    /// Add the metadata-reload flag
    pub fn with_needs_meta_reload(mut self) -> Self {
        self.0 |= Self::NEEDS_META_RELOAD;
        self
    }

    /// Drop the metadata-reload flag
    pub fn without_needs_meta_reload(mut self) -> Self {
        self.0 &= !Self::NEEDS_META_RELOAD;
        self
    }

    /// Check the metadata-reload flag
    pub fn needs_meta_reload(&self) -> bool {
        self.0 & Self::NEEDS_META_RELOAD != 0
    }

    /// Raw bits
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Fixed part of the descriptor block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    magic: [u8; 8],
    version: u32,
    flags: u32,
    identity: [u8; 16],
    block_size: u32,
    blocks_per_segment: u32,
    fast_segments: u32,
    free_segments: u32,
    slow_segments: u32,
    mpt_pages: u32,
    counter_pages: u32,
    version_map_bits: u32,
    mpt_entries: u32,
    first_fast_segment: u32,
    slow_main_blkaddr: u64,
    meta_start: u64,
    meta_end: u64,
    mpt_blkaddr: u64,
    counter_blkaddr0: u64,
    counter_blkaddr1: u64,
    main_blkaddr: u64,
    sequence: u64,
    checksum: u64,
}

const HEADER_SIZE: usize = mem::size_of::<RawHeader>();
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 8;

/// In-memory super-descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperDescriptor {
    /// Layout of both tiers
    pub layout: Layout,
    /// Identity of the slow tier this cache belongs to
    pub identity: Uuid,
    /// Descriptor flags
    pub flags: DescriptorFlags,
    /// Free fast segments
    pub free_segments: u32,
    /// Incremented on every descriptor write
    pub sequence: u64,
    /// Authoritative mapping copy per page (clear = A, set = B)
    pub version_map: Bitmap,
    /// Encoded allocation bitmap
    pub segment_map: Vec<u8>,
}

impl SuperDescriptor {
    /// Size of the fixed header
    pub const HEADER_SIZE: usize = HEADER_SIZE;

    /// Bytes the descriptor needs for `layout`
    pub fn encoded_len(layout: &Layout) -> usize {
        HEADER_SIZE
            + Bitmap::byte_len(layout.mpt_pages as usize)
            + Bitmap::byte_len(layout.fast_segments as usize)
    }

    /// Fresh descriptor for a newly formatted tier
    pub fn fresh(layout: Layout, identity: Uuid) -> Self {
        let version_map = Bitmap::new(layout.mpt_pages as usize);
        let segment_map = vec![0; Bitmap::byte_len(layout.fast_segments as usize)];
        Self {
            free_segments: layout.fast_segments,
            layout,
            identity,
            flags: DescriptorFlags::empty().with_needs_meta_reload(),
            sequence: 0,
            version_map,
            segment_map,
        }
    }

    /// Encode into one block
    pub fn encode(&self) -> Result<Vec<u8>> {
        let layout = &self.layout;
        let block_size = layout.block_size as usize;
        if Self::encoded_len(layout) > block_size {
            return Err(NvmError::InvalidGeometry(format!(
                "descriptor needs {} bytes, block is {block_size}",
                Self::encoded_len(layout)
            )));
        }

        let raw = RawHeader {
            magic: magic::NVMTIER1,
            version: FORMAT_VERSION.to_le(),
            flags: self.flags.value().to_le(),
            identity: *self.identity.as_bytes(),
            block_size: layout.block_size.to_le(),
            blocks_per_segment: layout.blocks_per_segment.to_le(),
            fast_segments: layout.fast_segments.to_le(),
            free_segments: self.free_segments.to_le(),
            slow_segments: layout.slow_segments.to_le(),
            mpt_pages: layout.mpt_pages.to_le(),
            counter_pages: layout.counter_pages.to_le(),
            version_map_bits: layout.mpt_pages.to_le(),
            mpt_entries: layout.mpt_entries().to_le(),
            first_fast_segment: ((layout.main_blkaddr / layout.blocks_per_segment as u64) as u32).to_le(),
            slow_main_blkaddr: layout.slow_main_blkaddr.to_le(),
            meta_start: layout.meta_start.to_le(),
            meta_end: layout.meta_end.to_le(),
            mpt_blkaddr: layout.mpt_blkaddr.to_le(),
            counter_blkaddr0: layout.counter_blkaddr[0].to_le(),
            counter_blkaddr1: layout.counter_blkaddr[1].to_le(),
            main_blkaddr: layout.main_blkaddr.to_le(),
            sequence: self.sequence.to_le(),
            checksum: 0,
        };

        let mut block = vec![0u8; block_size];
        block[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        let version_bytes = self.version_map.to_bytes();
        let mut offset = HEADER_SIZE;
        block[offset..offset + version_bytes.len()].copy_from_slice(&version_bytes);
        offset += version_bytes.len();
        block[offset..offset + self.segment_map.len()].copy_from_slice(&self.segment_map);

        let checksum = compute_xor_checksum(&block);
        block[CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
        Ok(block)
    }

    /// Decode a descriptor block
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < HEADER_SIZE {
            return Err(NvmError::Corruption("descriptor block too small".into()));
        }
        let raw: RawHeader = bytemuck::pod_read_unaligned(&block[..HEADER_SIZE]);
        if raw.magic != magic::NVMTIER1 {
            return Err(NvmError::Corruption("descriptor magic mismatch".into()));
        }
        let version = u32::from_le(raw.version);
        if version != FORMAT_VERSION {
            return Err(NvmError::Corruption(format!(
                "unsupported descriptor version {version}"
            )));
        }

        let stored = u64::from_le(raw.checksum);
        let mut scratch = block.to_vec();
        scratch[CHECKSUM_OFFSET..HEADER_SIZE].fill(0);
        if compute_xor_checksum(&scratch) != stored {
            return Err(NvmError::Corruption("descriptor checksum mismatch".into()));
        }

        let layout = Layout {
            block_size: u32::from_le(raw.block_size),
            blocks_per_segment: u32::from_le(raw.blocks_per_segment),
            fast_segments: u32::from_le(raw.fast_segments),
            slow_segments: u32::from_le(raw.slow_segments),
            slow_main_blkaddr: u64::from_le(raw.slow_main_blkaddr),
            meta_start: u64::from_le(raw.meta_start),
            meta_end: u64::from_le(raw.meta_end),
            mpt_blkaddr: u64::from_le(raw.mpt_blkaddr),
            mpt_pages: u32::from_le(raw.mpt_pages),
            counter_blkaddr: [
                u64::from_le(raw.counter_blkaddr0),
                u64::from_le(raw.counter_blkaddr1),
            ],
            counter_pages: u32::from_le(raw.counter_pages),
            main_blkaddr: u64::from_le(raw.main_blkaddr),
        };

        if layout.block_size as usize != block.len() {
            return Err(NvmError::Corruption(format!(
                "descriptor block size {} does not match {}",
                layout.block_size,
                block.len()
            )));
        }
        let rebuilt = FormatOptions::new(layout.fast_segments, layout.slow_segments)
            .with_block_size(layout.block_size)
            .with_blocks_per_segment(layout.blocks_per_segment)
            .with_slow_main_blkaddr(layout.slow_main_blkaddr)
            .with_meta_range(layout.meta_start, layout.meta_end)
            .layout()
            .map_err(|err| NvmError::Corruption(format!("descriptor geometry invalid: {err}")))?;
        if rebuilt != layout {
            return Err(NvmError::Corruption(format!(
                "descriptor regions inconsistent: stored {layout:?}, expected {rebuilt:?}"
            )));
        }
        if u32::from_le(raw.mpt_entries) != layout.mpt_entries()
            || u32::from_le(raw.version_map_bits) != layout.mpt_pages
        {
            return Err(NvmError::Corruption("descriptor geometry inconsistent".into()));
        }
        if Self::encoded_len(&layout) > block.len() {
            return Err(NvmError::Corruption("descriptor bitmaps overflow block".into()));
        }

        let version_len = Bitmap::byte_len(layout.mpt_pages as usize);
        let segment_len = Bitmap::byte_len(layout.fast_segments as usize);
        let version_map = Bitmap::from_bytes(
            layout.mpt_pages as usize,
            &block[HEADER_SIZE..HEADER_SIZE + version_len],
        )
        .ok_or_else(|| NvmError::Corruption("version map truncated".into()))?;
        let start = HEADER_SIZE + version_len;
        let segment_map = block[start..start + segment_len].to_vec();

        Ok(Self {
            layout,
            identity: Uuid::from_bytes(raw.identity),
            flags: DescriptorFlags::new(u32::from_le(raw.flags)),
            free_segments: u32::from_le(raw.free_segments),
            sequence: u64::from_le(raw.sequence),
            version_map,
            segment_map,
        })
    }
}

impl fmt::Display for SuperDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nvmtier {} seq={} fast={}/{} slow={} bs={} bps={}",
            self.identity,
            self.sequence,
            self.free_segments,
            self.layout.fast_segments,
            self.layout.slow_segments,
            self.layout.block_size,
            self.layout.blocks_per_segment
        )
    }
}

/// XOR of all little-endian 8-byte words, zero-padding the tail
pub fn compute_xor_checksum(data: &[u8]) -> u64 {
    let mut checksum: u64 = 0;

    let mut chunks = data.chunks_exact(8);
    for chunk in chunks.by_ref() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        checksum ^= u64::from_le_bytes(word);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut last = [0u8; 8];
        last[..remainder.len()].copy_from_slice(remainder);
        checksum ^= u64::from_le_bytes(last);
    }

    checksum
}
