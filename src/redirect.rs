//! I/O redirection
//!
//! Every request the host submits to the slow tier is first resolved here.
//! Metadata blocks in the mirrored range and blocks of mapped segments are
//! sent to the fast tier; everything else stays where it was addressed.

use std::fmt;

use crate::address::{Layout, Target};
use crate::gc::MigrationLock;
use crate::lfu::AccessCounters;
use crate::mapping::MappingTable;
use crate::stats::RedirectStats;
use crate::status::{NvmError, Result};

/// Times a writer re-checks a migrating segment before giving up
const MAX_MIGRATION_WAITS: u32 = 16;

/// Request direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoOp {
    /// Read
    Read = 0,
    /// Write
    Write = 1,
}

impl IoOp {
    /// All directions
    pub const ALL: [IoOp; 2] = [IoOp::Read, IoOp::Write];

    /// Get the direction name
    pub const fn as_str(&self) -> &'static str {
        match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of block a request carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// File data
    Data = 0,
    /// Filesystem node (inode / index) blocks
    Node = 1,
    /// Checkpoint and other metadata-area blocks
    Meta = 2,
}

impl PageType {
    /// All page types
    pub const ALL: [PageType; 3] = [PageType::Data, PageType::Node, PageType::Meta];

    /// Get the page type name
    pub const fn as_str(&self) -> &'static str {
        match self {
            PageType::Data => "data",
            PageType::Node => "node",
            PageType::Meta => "meta",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A block request addressed to the slow tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    /// Direction
    pub op: IoOp,
    /// Page type
    pub kind: PageType,
    /// First slow-tier block
    pub block: u64,
    /// Number of blocks
    pub nr_blocks: u32,
}

impl IoRequest {
    /// Read request
    pub const fn read(kind: PageType, block: u64, nr_blocks: u32) -> Self {
        Self {
            op: IoOp::Read,
            kind,
            block,
            nr_blocks,
        }
    }

    /// Write request
    pub const fn write(kind: PageType, block: u64, nr_blocks: u32) -> Self {
        Self {
            op: IoOp::Write,
            kind,
            block,
            nr_blocks,
        }
    }

    /// Last block covered; `None` for an empty or wrapping range
    fn last_block(&self) -> Option<u64> {
        (self.nr_blocks as u64)
            .checked_sub(1)
            .and_then(|extra| self.block.checked_add(extra))
    }
}

impl fmt::Display for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}+{}",
            self.kind, self.op, self.block, self.nr_blocks
        )
    }
}

/// Borrowed view of the state a request is resolved against
pub(crate) struct Redirector<'a> {
    pub(crate) layout: &'a Layout,
    pub(crate) mapping: &'a MappingTable,
    pub(crate) counters: &'a AccessCounters,
    pub(crate) migration: &'a MigrationLock,
    pub(crate) meta_reloaded: bool,
}

impl Redirector<'_> {
    /// Resolve `req`, recording it in `stats`
    pub(crate) fn resolve(&self, req: &IoRequest, stats: &RedirectStats) -> Result<Target> {
        let target = self.resolve_inner(req)?;
        stats.record(req.kind, req.op, target.is_fast(), req.nr_blocks);
        Ok(target)
    }

    fn resolve_inner(&self, req: &IoRequest) -> Result<Target> {
        if req.nr_blocks == 0 {
            return Err(NvmError::InvalidRequest(format!("empty request: {req}")));
        }
        let last = req.last_block().ok_or_else(|| {
            NvmError::InvalidRequest(format!("block range overflows: {req}"))
        })?;
        let layout = self.layout;

        if req.kind == PageType::Meta {
            let first_in = layout.is_meta_block(req.block);
            let last_in = layout.is_meta_block(last);
            if first_in && last_in {
                let fast = match req.op {
                    IoOp::Read => self.meta_reloaded,
                    IoOp::Write => true,
                };
                return Ok(if fast {
                    Target::fast(req.block)
                } else {
                    Target::slow(req.block)
                });
            }
            if req.block < layout.meta_end && last >= layout.meta_start {
                return Err(NvmError::InvalidRequest(format!(
                    "request straddles the metadata mirror: {req}"
                )));
            }
            if last < layout.slow_main_blkaddr {
                return Ok(Target::slow(req.block));
            }
        }

        let (segment, offset) = layout.slow_segment_of(req.block).ok_or_else(|| {
            NvmError::InvalidRequest(format!("outside the slow main area: {req}"))
        })?;
        if offset as u64 + req.nr_blocks as u64 > layout.blocks_per_segment as u64 {
            return Err(NvmError::InvalidRequest(format!(
                "crosses a segment boundary: {req}"
            )));
        }

        for _ in 0..MAX_MIGRATION_WAITS {
            let entry = self.mapping.slow_entry(segment)?;
            let redirected = match req.op {
                IoOp::Read => entry.flags.read,
                IoOp::Write => entry.flags.write,
            };
            if redirected {
                self.counters.record_access(entry.target);
                return Ok(Target::fast(layout.fast_block(entry.target, offset)));
            }
            if req.op == IoOp::Write && entry.is_migrating() {
                if tracing::enabled!(tracing::Level::TRACE) {
                    tracing::trace!(segment, fast = entry.target, "writer waiting on migration");
                }
                self.migration.wait();
                continue;
            }
            return Ok(Target::slow(req.block));
        }

        Err(NvmError::invariant(format!(
            "slow segment {segment} stayed in migration across {MAX_MIGRATION_WAITS} waits"
        )))
    }
}
