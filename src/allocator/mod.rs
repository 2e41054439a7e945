//! Fast-tier segment allocation
//!
//! # Overview
//!
//! Fast segments are handed out from `segment_map` by a rotating cursor. A
//! segment freed since the last checkpoint stays pinned until the checkpoint
//! snapshot catches up, so the last committed mapping never points at a
//! segment that has already been reused.
//!
//! ```text
//! segment_map       1 1 0 0 1 0
//! ckpt_segment_map  1 1 1 0 0 0
//! allocatable             ^   ^
//! ```

mod segment_allocator;

pub use segment_allocator::{AllocatorSnapshot, SegmentAllocator};
