//! Aligned scratch memory for segment migration

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Zeroed, aligned buffer allocated once and reused across migrations
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PinnedBuffer {
    /// Allocate `size` zeroed bytes aligned to `alignment`.
    ///
    /// Returns `None` for a zero size, a non power-of-two alignment, or when
    /// the allocator fails.
    pub fn zeroed(alignment: usize, size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Alignment in bytes
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Get a mutable slice view of the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for `size` initialized bytes, and `&mut self`
        // guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Safety: PinnedBuffer owns its memory and doesn't share references
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("size", &self.size())
            .field("alignment", &self.alignment())
            .finish()
    }
}
