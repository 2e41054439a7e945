//! Lock-protected mapping table with page-granular dirty tracking

use parking_lot::RwLock;

use crate::bitmap::Bitmap;
use crate::mapping::{MappingEntry, RedirectFlags};
use crate::status::{NvmError, Result};

/// Encoded mapping page ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyPage {
    /// Page index within the table
    pub page: u32,
    /// `block_size` bytes of little-endian packed entries
    pub bytes: Vec<u8>,
}

struct TableInner {
    entries: Vec<MappingEntry>,
    dirty: Bitmap,
}

impl TableInner {
    fn mark(&mut self, index: u32, entries_per_page: u32) {
        self.dirty.set((index / entries_per_page) as usize);
    }
}

/// Bidirectional fast/slow segment mapping
///
/// Entries and the dirty-page bitmap share one lock, so a pair is always
/// updated and marked dirty in a single critical section.
pub struct MappingTable {
    inner: RwLock<TableInner>,
    fast_segments: u32,
    slow_segments: u32,
    entries_per_page: u32,
}

impl MappingTable {
    /// Create an empty table
    pub fn new(fast_segments: u32, slow_segments: u32, entries_per_page: u32) -> Self {
        let len = (fast_segments + slow_segments) as usize;
        let pages = len.div_ceil(entries_per_page as usize);
        Self {
            inner: RwLock::new(TableInner {
                entries: vec![MappingEntry::EMPTY; len],
                dirty: Bitmap::new(pages),
            }),
            fast_segments,
            slow_segments,
            entries_per_page,
        }
    }

    /// Total entries (N + M)
    pub fn len(&self) -> u32 {
        self.fast_segments + self.slow_segments
    }

    /// Check if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fast-tier segments (N)
    pub fn fast_segments(&self) -> u32 {
        self.fast_segments
    }

    /// Number of slow-tier segments (M)
    pub fn slow_segments(&self) -> u32 {
        self.slow_segments
    }

    /// Number of on-disk pages
    pub fn pages(&self) -> u32 {
        self.len().div_ceil(self.entries_per_page)
    }

    /// Page holding entry `index`
    pub fn page_of(&self, index: u32) -> u32 {
        index / self.entries_per_page
    }

    /// Table index of slow segment `slow`
    #[inline]
    pub fn slow_index(&self, slow: u32) -> u32 {
        self.fast_segments + slow
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.len() {
            return Err(NvmError::invariant(format!(
                "mapping index {index} out of range ({} entries)",
                self.len()
            )));
        }
        Ok(())
    }

    fn check_fast(&self, fast: u32) -> Result<()> {
        if fast >= self.fast_segments {
            return Err(NvmError::invariant(format!(
                "fast segment {fast} out of range ({})",
                self.fast_segments
            )));
        }
        Ok(())
    }

    fn check_slow(&self, slow: u32) -> Result<()> {
        if slow >= self.slow_segments {
            return Err(NvmError::invariant(format!(
                "slow segment {slow} out of range ({})",
                self.slow_segments
            )));
        }
        Ok(())
    }

    /// Read entry `index`
    pub fn lookup(&self, index: u32) -> Result<MappingEntry> {
        self.check_index(index)?;
        Ok(self.inner.read().entries[index as usize])
    }

    /// Entry describing fast segment `fast`
    pub fn fast_entry(&self, fast: u32) -> Result<MappingEntry> {
        self.check_fast(fast)?;
        Ok(self.inner.read().entries[fast as usize])
    }

    /// Entry describing slow segment `slow`
    pub fn slow_entry(&self, slow: u32) -> Result<MappingEntry> {
        self.check_slow(slow)?;
        Ok(self.inner.read().entries[self.slow_index(slow) as usize])
    }

    /// Overwrite a single entry.
    ///
    /// This does not touch the partner entry; use the paired helpers to keep
    /// the table symmetric.
    pub fn set(&self, index: u32, target: u32, flags: RedirectFlags) -> Result<()> {
        self.check_index(index)?;
        if target > MappingEntry::MAX_TARGET {
            return Err(NvmError::invariant(format!("target {target} not packable")));
        }
        let mut inner = self.inner.write();
        inner.entries[index as usize] = MappingEntry::new(target, flags);
        inner.mark(index, self.entries_per_page);
        Ok(())
    }

    /// Replace the redirect bits of one entry, keeping its target
    pub fn set_redirect_flags(&self, index: u32, flags: RedirectFlags) -> Result<()> {
        self.check_index(index)?;
        let mut inner = self.inner.write();
        inner.entries[index as usize].flags = flags;
        inner.mark(index, self.entries_per_page);
        Ok(())
    }

    /// Map fast segment `fast` to slow segment `slow` and back
    pub fn establish(&self, fast: u32, slow: u32, flags: RedirectFlags) -> Result<()> {
        self.check_fast(fast)?;
        self.check_slow(slow)?;
        let slow_idx = self.slow_index(slow);

        let mut inner = self.inner.write();
        if inner.entries[fast as usize].is_mapped() {
            return Err(NvmError::invariant(format!(
                "fast segment {fast} already mapped"
            )));
        }
        if inner.entries[slow_idx as usize].is_mapped() {
            return Err(NvmError::invariant(format!(
                "slow segment {slow} already mapped"
            )));
        }
        inner.entries[fast as usize] = MappingEntry::new(slow, flags);
        inner.entries[slow_idx as usize] = MappingEntry::new(fast, flags);
        inner.mark(fast, self.entries_per_page);
        inner.mark(slow_idx, self.entries_per_page);
        Ok(())
    }

    /// Resolve the slow partner of `fast`, checking the back pointer.
    ///
    /// Returns `None` if the fast segment is unmapped.
    fn partner(&self, inner: &TableInner, fast: u32) -> Result<Option<u32>> {
        let entry = inner.entries[fast as usize];
        if !entry.is_mapped() {
            return Ok(None);
        }
        let slow = entry.target;
        self.check_slow(slow)?;
        let back = inner.entries[self.slow_index(slow) as usize];
        if back.target != fast || back.flags != entry.flags {
            return Err(NvmError::invariant(format!(
                "asymmetric pair: fast {fast} -> slow {slow} ({}), slow -> fast {} ({})",
                entry.flags, back.target, back.flags
            )));
        }
        Ok(Some(slow))
    }

    /// Slow segment mapped to `fast`, if any
    pub fn slow_of(&self, fast: u32) -> Result<Option<u32>> {
        self.check_fast(fast)?;
        let inner = self.inner.read();
        self.partner(&inner, fast)
    }

    /// Set the redirect bits of both entries of the pair containing `fast`
    pub fn set_pair_flags(&self, fast: u32, flags: RedirectFlags) -> Result<u32> {
        self.check_fast(fast)?;
        let mut inner = self.inner.write();
        let slow = self.partner(&inner, fast)?.ok_or_else(|| {
            NvmError::invariant(format!("fast segment {fast} is not mapped"))
        })?;
        let slow_idx = self.slow_index(slow);
        inner.entries[fast as usize].flags = flags;
        inner.entries[slow_idx as usize].flags = flags;
        inner.mark(fast, self.entries_per_page);
        inner.mark(slow_idx, self.entries_per_page);
        Ok(slow)
    }

    /// Tear down the pair containing `fast`, returning the slow partner
    pub fn clear_pair(&self, fast: u32) -> Result<u32> {
        self.check_fast(fast)?;
        let mut inner = self.inner.write();
        let slow = self.partner(&inner, fast)?.ok_or_else(|| {
            NvmError::invariant(format!("fast segment {fast} is not mapped"))
        })?;
        let slow_idx = self.slow_index(slow);
        inner.entries[fast as usize] = MappingEntry::EMPTY;
        inner.entries[slow_idx as usize] = MappingEntry::EMPTY;
        inner.mark(fast, self.entries_per_page);
        inner.mark(slow_idx, self.entries_per_page);
        Ok(slow)
    }

    /// Tear down the pair containing slow segment `slow`, returning the fast
    /// partner. Unmapped slow segments are a no-op.
    pub fn clear_slow(&self, slow: u32) -> Result<Option<u32>> {
        self.check_slow(slow)?;
        let slow_idx = self.slow_index(slow);
        let mut inner = self.inner.write();
        let entry = inner.entries[slow_idx as usize];
        if !entry.is_mapped() {
            return Ok(None);
        }
        let fast = entry.target;
        self.check_fast(fast)?;
        if self.partner(&inner, fast)? != Some(slow) {
            return Err(NvmError::invariant(format!(
                "slow segment {slow} points at fast {fast} which does not point back"
            )));
        }
        inner.entries[fast as usize] = MappingEntry::EMPTY;
        inner.entries[slow_idx as usize] = MappingEntry::EMPTY;
        inner.mark(fast, self.entries_per_page);
        inner.mark(slow_idx, self.entries_per_page);
        Ok(Some(fast))
    }

    /// Number of mapped fast segments
    pub fn mapped_count(&self) -> u32 {
        let inner = self.inner.read();
        inner.entries[..self.fast_segments as usize]
            .iter()
            .filter(|e| e.is_mapped())
            .count() as u32
    }

    /// Verify that every mapped entry has a matching partner
    pub fn check_symmetry(&self) -> Result<()> {
        let inner = self.inner.read();
        for fast in 0..self.fast_segments {
            self.partner(&inner, fast)?;
        }
        for slow in 0..self.slow_segments {
            let entry = inner.entries[self.slow_index(slow) as usize];
            if entry.is_mapped() {
                self.check_fast(entry.target)?;
                if self.partner(&inner, entry.target)? != Some(slow) {
                    return Err(NvmError::invariant(format!(
                        "slow segment {slow} has no matching fast entry"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode `page` as `entries_per_page` little-endian words
    fn encode_page(&self, inner: &TableInner, page: u32) -> Vec<u8> {
        let epp = self.entries_per_page as usize;
        let mut bytes = vec![0u8; epp * 4];
        let start = page as usize * epp;
        let end = (start + epp).min(inner.entries.len());
        for (slot, entry) in inner.entries[start..end].iter().enumerate() {
            bytes[slot * 4..slot * 4 + 4].copy_from_slice(&entry.pack().to_le_bytes());
        }
        bytes
    }

    /// Snapshot and clear the dirty pages.
    ///
    /// With `flush_all` every page is returned. Callers that fail to persist a
    /// page must hand it back via [`MappingTable::mark_dirty`].
    pub fn take_dirty_pages(&self, flush_all: bool) -> Vec<DirtyPage> {
        self.take_dirty_pages_with(flush_all, || ()).0
    }

    /// [`MappingTable::take_dirty_pages`], running `cut` before the table
    /// lock is dropped.
    ///
    /// Pair changes happen under the table lock, so whatever `cut` captures
    /// is consistent with the returned pages. `cut` must not touch the table.
    pub fn take_dirty_pages_with<R>(
        &self,
        flush_all: bool,
        cut: impl FnOnce() -> R,
    ) -> (Vec<DirtyPage>, R) {
        let mut inner = self.inner.write();
        let pages: Vec<u32> = if flush_all {
            (0..self.pages()).collect()
        } else {
            inner.dirty.iter_ones().map(|p| p as u32).collect()
        };
        let out = pages
            .into_iter()
            .map(|page| DirtyPage {
                page,
                bytes: self.encode_page(&inner, page),
            })
            .collect();
        inner.dirty.clear_all();
        (out, cut())
    }

    /// Re-arm a page whose flush failed
    pub fn mark_dirty(&self, page: u32) {
        if page < self.pages() {
            self.inner.write().dirty.set(page as usize);
        }
    }

    /// Number of dirty pages
    pub fn dirty_count(&self) -> usize {
        self.inner.read().dirty.count_ones()
    }

    /// Replace the entries of `page` from their on-disk form
    pub fn load_page(&self, page: u32, bytes: &[u8]) -> Result<()> {
        let epp = self.entries_per_page as usize;
        if page >= self.pages() || bytes.len() < epp * 4 {
            return Err(NvmError::Corruption(format!(
                "mapping page {page} malformed ({} bytes)",
                bytes.len()
            )));
        }
        let mut inner = self.inner.write();
        let start = page as usize * epp;
        let end = (start + epp).min(inner.entries.len());
        for (slot, entry) in inner.entries[start..end].iter_mut().enumerate() {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[slot * 4..slot * 4 + 4]);
            *entry = MappingEntry::unpack(u32::from_le_bytes(word));
        }
        Ok(())
    }
}
