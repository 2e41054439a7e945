//! Rotating-cursor segment allocator

use parking_lot::Mutex;

use crate::bitmap::Bitmap;
use crate::mapping::{MappingTable, RedirectFlags};
use crate::status::{NvmError, Result};

struct AllocState {
    segment_map: Bitmap,
    ckpt_segment_map: Bitmap,
    cursor: u32,
    free: u32,
    super_dirty: bool,
}

/// Point-in-time copy of the allocator's persistent state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorSnapshot {
    /// Encoded `segment_map`
    pub segment_map: Vec<u8>,
    /// Free segment count
    pub free: u32,
}

/// Allocator over the fast tier's data segments
///
/// `segment_map` and its checkpoint snapshot share one lock. The allocator
/// never holds it while touching the mapping table.
pub struct SegmentAllocator {
    state: Mutex<AllocState>,
    total: u32,
}

impl SegmentAllocator {
    /// Create an allocator with every segment free
    pub fn new(total: u32) -> Self {
        Self {
            state: Mutex::new(AllocState {
                segment_map: Bitmap::new(total as usize),
                ckpt_segment_map: Bitmap::new(total as usize),
                cursor: 0,
                free: total,
                super_dirty: false,
            }),
            total,
        }
    }

    /// Rebuild from a persisted `segment_map`.
    ///
    /// The checkpoint snapshot starts equal to the loaded map.
    pub fn from_persisted(total: u32, bytes: &[u8], free: u32) -> Result<Self> {
        let segment_map = Bitmap::from_bytes(total as usize, bytes).ok_or_else(|| {
            NvmError::Corruption(format!("segment map truncated ({} bytes)", bytes.len()))
        })?;
        let used = segment_map.count_ones() as u32;
        if used + free != total {
            return Err(NvmError::Corruption(format!(
                "free count {free} disagrees with segment map ({used} of {total} used)"
            )));
        }
        let ckpt_segment_map = segment_map.clone();
        Ok(Self {
            state: Mutex::new(AllocState {
                segment_map,
                ckpt_segment_map,
                cursor: 0,
                free,
                super_dirty: false,
            }),
            total,
        })
    }

    /// Total fast segments
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Free fast segments
    pub fn free(&self) -> u32 {
        self.state.lock().free
    }

    /// Check whether fast segment `fast` is allocated
    pub fn is_allocated(&self, fast: u32) -> bool {
        fast < self.total && self.state.lock().segment_map.test(fast as usize)
    }

    /// Check whether free capacity fell below `limit_percent` of the total
    pub fn under_pressure(&self, limit_percent: u32) -> bool {
        let free = self.free() as u64;
        free < self.total as u64 * limit_percent as u64 / 100
    }

    /// Reserve a fast segment and map `slow` to it, fully redirected.
    ///
    /// Fails with [`NvmError::NoSpace`] when every clear bit is still pinned
    /// by the checkpoint snapshot or no bit is clear at all.
    pub fn allocate(&self, slow: u32, mapping: &MappingTable) -> Result<u32> {
        if slow >= mapping.slow_segments() {
            return Err(NvmError::invariant(format!(
                "slow segment {slow} out of range ({})",
                mapping.slow_segments()
            )));
        }
        if mapping.slow_entry(slow)?.is_mapped() {
            return Err(NvmError::invariant(format!(
                "slow segment {slow} already mapped"
            )));
        }

        let fast = self.reserve()?;

        if let Err(err) = mapping.establish(fast, slow, RedirectFlags::FULL) {
            // Lost a race for `slow`; hand the bit back.
            self.unreserve(fast);
            return Err(err);
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(fast, slow, "fast segment allocated");
        }
        Ok(fast)
    }

    fn reserve(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.free == 0 {
            return Err(NvmError::NoSpace);
        }

        let start = state.cursor as usize;
        let total = self.total as usize;
        let found = Self::scan(&state, start, total).or_else(|| Self::scan(&state, 0, start));
        let Some(fast) = found else {
            return Err(NvmError::NoSpace);
        };

        state.segment_map.set(fast);
        state.free -= 1;
        state.super_dirty = true;
        state.cursor = if fast + 1 >= total { 0 } else { fast as u32 + 1 };
        Ok(fast as u32)
    }

    /// First segment in `[from, to)` clear in both maps
    fn scan(state: &AllocState, from: usize, to: usize) -> Option<usize> {
        let mut pos = from;
        while pos < to {
            let candidate = state.segment_map.find_next_zero(pos)?;
            if candidate >= to {
                return None;
            }
            if !state.ckpt_segment_map.test(candidate) {
                return Some(candidate);
            }
            pos = candidate + 1;
        }
        None
    }

    fn unreserve(&self, fast: u32) {
        let mut state = self.state.lock();
        if state.segment_map.test(fast as usize) {
            state.segment_map.clear(fast as usize);
            state.free += 1;
        }
    }

    /// Return fast segment `fast` to the free pool
    pub fn release(&self, fast: u32) -> Result<()> {
        if fast >= self.total {
            return Err(NvmError::invariant(format!(
                "fast segment {fast} out of range ({})",
                self.total
            )));
        }
        let mut state = self.state.lock();
        if !state.segment_map.test(fast as usize) {
            return Err(NvmError::invariant(format!(
                "fast segment {fast} released while free"
            )));
        }
        state.segment_map.clear(fast as usize);
        state.free += 1;
        state.super_dirty = true;
        Ok(())
    }

    /// Copy `segment_map` into the checkpoint snapshot
    pub fn commit_snapshot(&self) {
        let mut state = self.state.lock();
        let AllocState {
            segment_map,
            ckpt_segment_map,
            ..
        } = &mut *state;
        ckpt_segment_map.copy_from(segment_map);
    }

    /// Encoded allocation state for the descriptor
    pub fn snapshot(&self) -> AllocatorSnapshot {
        let state = self.state.lock();
        AllocatorSnapshot {
            segment_map: state.segment_map.to_bytes(),
            free: state.free,
        }
    }

    /// Snapshot and clear the descriptor-dirty flag in one step
    ///
    /// A release landing after this call re-arms the flag for the next
    /// checkpoint.
    pub fn take_snapshot(&self) -> (AllocatorSnapshot, bool) {
        let mut state = self.state.lock();
        let snap = AllocatorSnapshot {
            segment_map: state.segment_map.to_bytes(),
            free: state.free,
        };
        (snap, std::mem::take(&mut state.super_dirty))
    }

    /// Mark the descriptor dirty again after a failed write
    pub fn mark_super_dirty(&self) {
        self.state.lock().super_dirty = true;
    }
}
