//! Format, load and checkpoint of the fast tier's metadata

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Layout;
use crate::allocator::{AllocatorSnapshot, SegmentAllocator};
use crate::bitmap::Bitmap;
use crate::checkpoint::VersionFlags;
use crate::device::{read_exact_at, write_all_at, SyncStorageDevice, WriteHint};
use crate::format::{DescriptorFlags, FormatOptions, SuperDescriptor};
use crate::lfu::AccessCounters;
use crate::mapping::{DirtyPage, MappingTable};
use crate::status::{NvmError, Result};

/// Lay out a fresh fast tier on `device`.
///
/// Zeroes both mapping copies and both counter copies, then writes the
/// descriptor to both slots with `NEEDS_META_RELOAD` set.
pub fn format_device(
    device: &dyn SyncStorageDevice,
    options: &FormatOptions,
) -> Result<SuperDescriptor> {
    let layout = options.layout()?;

    let needed = layout.fast_device_bytes();
    let size = device.size_sync()?;
    if size < needed {
        device.truncate_sync(needed)?;
    }

    let bs = layout.block_size as usize;
    let mpt_zeroes = vec![0u8; 2 * layout.mpt_pages as usize * bs];
    write_all_at(
        device,
        layout.byte_offset(layout.mpt_blkaddr),
        &mpt_zeroes,
        WriteHint::None,
    )?;
    let counter_zeroes = vec![0u8; layout.counter_pages as usize * bs];
    for copy in [false, true] {
        write_all_at(
            device,
            layout.byte_offset(layout.counter_block(copy)),
            &counter_zeroes,
            WriteHint::None,
        )?;
    }

    let desc = SuperDescriptor::fresh(layout, options.identity);
    let block = desc.encode()?;
    for slot in [0u64, 1] {
        write_all_at(device, desc.layout.byte_offset(slot), &block, WriteHint::None)?;
    }
    device.flush_sync()?;

    tracing::info!(
        identity = %desc.identity,
        fast_segments = desc.layout.fast_segments,
        slow_segments = desc.layout.slow_segments,
        main_blkaddr = desc.layout.main_blkaddr,
        "fast tier formatted"
    );
    Ok(desc)
}

/// Read and validate the descriptor in `slot`
pub fn read_descriptor(
    device: &dyn SyncStorageDevice,
    block_size: u32,
    slot: bool,
) -> Result<SuperDescriptor> {
    let mut block = vec![0u8; block_size as usize];
    read_exact_at(device, slot as u64 * block_size as u64, &mut block)?;
    SuperDescriptor::decode(&block)
}

struct PersistState {
    committed_versions: Bitmap,
    pending_versions: Bitmap,
    flags: DescriptorFlags,
    header_dirty: bool,
    sequence: u64,
}

/// Persistent-metadata writer for one mounted tier
///
/// One checkpoint runs at a time; the state lock is held for its duration.
pub struct MetaPersistence {
    layout: Layout,
    identity: Uuid,
    state: Mutex<PersistState>,
}

impl MetaPersistence {
    /// Resume from a loaded descriptor
    pub fn new(desc: &SuperDescriptor) -> Self {
        Self {
            layout: desc.layout.clone(),
            identity: desc.identity,
            state: Mutex::new(PersistState {
                committed_versions: desc.version_map.clone(),
                pending_versions: desc.version_map.clone(),
                flags: desc.flags,
                header_dirty: false,
                sequence: desc.sequence,
            }),
        }
    }

    /// Layout being persisted
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Descriptor flags as they will be written next
    pub fn descriptor_flags(&self) -> DescriptorFlags {
        self.state.lock().flags
    }

    /// Clear `NEEDS_META_RELOAD`; persisted by the next checkpoint
    pub fn clear_meta_reload(&self) {
        let mut state = self.state.lock();
        if state.flags.needs_meta_reload() {
            state.flags = state.flags.without_needs_meta_reload();
            state.header_dirty = true;
        }
    }

    /// Authoritative copy of mapping page `page`
    pub fn committed_version(&self, page: u32) -> bool {
        self.state.lock().committed_versions.test(page as usize)
    }

    /// Fill `mapping` from the authoritative page copies
    pub fn load_mapping(
        &self,
        device: &dyn SyncStorageDevice,
        mapping: &MappingTable,
    ) -> Result<()> {
        let state = self.state.lock();
        let mut block = vec![0u8; self.layout.block_size as usize];
        for page in 0..self.layout.mpt_pages {
            let version = state.committed_versions.test(page as usize);
            let blkaddr = self.layout.mpt_page_block(page, version);
            read_exact_at(device, self.layout.byte_offset(blkaddr), &mut block)?;
            mapping.load_page(page, &block)?;
        }
        mapping
            .check_symmetry()
            .map_err(|e| NvmError::Corruption(format!("mapping table: {e}")))
    }

    /// Fill `counters` from the copy selected by `flags`
    pub fn load_counters(
        &self,
        device: &dyn SyncStorageDevice,
        counters: &AccessCounters,
        flags: VersionFlags,
    ) -> Result<()> {
        let mut buf = vec![0u8; self.layout.counter_pages as usize * self.layout.block_size as usize];
        let blkaddr = self.layout.counter_block(flags.counter_copy());
        read_exact_at(device, self.layout.byte_offset(blkaddr), &mut buf)?;
        counters.load(&buf)
    }

    /// Write every pending change to the non-authoritative copies.
    ///
    /// Returns the selector flags the host must commit. On failure nothing
    /// authoritative was touched and every written piece is re-armed for the
    /// next attempt.
    pub fn checkpoint(
        &self,
        device: &dyn SyncStorageDevice,
        flags: VersionFlags,
        mapping: &MappingTable,
        allocator: &SegmentAllocator,
        counters: &AccessCounters,
    ) -> Result<VersionFlags> {
        let mut state = self.state.lock();
        // teardown clears the pair before freeing the segment, so a cut
        // taken under the table lock never sees a mapped free segment
        let (pages, (alloc, super_dirty)) =
            mapping.take_dirty_pages_with(false, || allocator.take_snapshot());
        let mut written = 0;

        let result = self.write_checkpoint(
            &mut state,
            device,
            flags,
            &pages,
            &mut written,
            (alloc, super_dirty),
            counters,
        );

        if let Err(err) = &result {
            for page in &pages {
                mapping.mark_dirty(page.page);
            }
            state.header_dirty = true;
            if super_dirty {
                allocator.mark_super_dirty();
            }
            tracing::warn!(
                error = %err,
                pages = pages.len(),
                written,
                "checkpoint failed; metadata re-armed"
            );
        } else if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(pages = written, flags = %flags, "checkpoint written");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn write_checkpoint(
        &self,
        state: &mut PersistState,
        device: &dyn SyncStorageDevice,
        flags: VersionFlags,
        pages: &[DirtyPage],
        written: &mut usize,
        (alloc, super_dirty): (AllocatorSnapshot, bool),
        counters: &AccessCounters,
    ) -> Result<VersionFlags> {
        let layout = &self.layout;
        let mut new_flags = flags;

        for page in pages {
            let target = !state.committed_versions.test(page.page as usize);
            let blkaddr = layout.mpt_page_block(page.page, target);
            write_all_at(device, layout.byte_offset(blkaddr), &page.bytes, WriteHint::None)?;
            state.pending_versions.assign(page.page as usize, target);
            *written += 1;
        }

        let copy = !flags.counter_copy();
        let encoded = counters.encode(layout.counter_pages as usize * layout.block_size as usize);
        write_all_at(
            device,
            layout.byte_offset(layout.counter_block(copy)),
            &encoded,
            WriteHint::None,
        )?;
        new_flags = new_flags.toggle_counters();

        if super_dirty || state.header_dirty || state.pending_versions != state.committed_versions
        {
            let desc = SuperDescriptor {
                layout: layout.clone(),
                identity: self.identity,
                flags: state.flags,
                free_segments: alloc.free,
                sequence: state.sequence + 1,
                version_map: state.pending_versions.clone(),
                segment_map: alloc.segment_map,
            };
            let slot = !flags.super_slot();
            let block = desc.encode()?;
            write_all_at(device, layout.byte_offset(slot as u64), &block, WriteHint::None)?;
            state.sequence += 1;
            state.header_dirty = false;
            new_flags = new_flags.toggle_super();
        }

        device.flush_sync()?;
        Ok(new_flags)
    }

    /// Promote the version bits written by the last checkpoint
    pub fn commit(&self) {
        let mut state = self.state.lock();
        let PersistState {
            committed_versions,
            pending_versions,
            ..
        } = &mut *state;
        committed_versions.copy_from(pending_versions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::mapping::RedirectFlags;

    fn options() -> FormatOptions {
        FormatOptions::new(4, 16)
            .with_blocks_per_segment(8)
            .with_slow_main_blkaddr(64)
            .with_meta_range(2, 8)
            .with_identity(Uuid::from_u128(7))
    }

    struct Parts {
        dev: MemDevice,
        persist: MetaPersistence,
        mapping: MappingTable,
        alloc: SegmentAllocator,
        counters: AccessCounters,
    }

    fn formatted() -> Parts {
        let dev = MemDevice::new();
        let desc = format_device(&dev, &options()).unwrap();
        Parts {
            persist: MetaPersistence::new(&desc),
            mapping: MappingTable::new(4, 16, desc.layout.entries_per_page()),
            alloc: SegmentAllocator::new(4),
            counters: AccessCounters::new(4),
            dev,
        }
    }

    #[test]
    fn test_format_writes_both_slots() {
        let p = formatted();
        assert_eq!(p.dev.size_sync().unwrap(), (16 + 32) * 4096);
        let a = read_descriptor(&p.dev, 4096, false).unwrap();
        let b = read_descriptor(&p.dev, 4096, true).unwrap();
        assert_eq!(a, b);
        assert!(a.flags.needs_meta_reload());
        assert_eq!(a.identity, Uuid::from_u128(7));
        assert_eq!(a.free_segments, 4);
    }

    #[test]
    fn test_checkpoint_alternates_copies() {
        let p = formatted();
        p.alloc.allocate(9, &p.mapping).unwrap();
        p.counters.record_access(0);

        let flags = VersionFlags::default();
        let next = p
            .persist
            .checkpoint(&p.dev, flags, &p.mapping, &p.alloc, &p.counters)
            .unwrap();
        assert!(next.super_slot());
        assert!(next.counter_copy());

        // the old slot is untouched
        let old = read_descriptor(&p.dev, 4096, false).unwrap();
        assert_eq!(old.free_segments, 4);
        let new = read_descriptor(&p.dev, 4096, true).unwrap();
        assert_eq!(new.free_segments, 3);
        assert!(new.version_map.test(0));
        assert_eq!(new.sequence, old.sequence + 1);

        p.persist.commit();
        assert!(p.persist.committed_version(0));

        let mapping = MappingTable::new(4, 16, 1024);
        p.persist.load_mapping(&p.dev, &mapping).unwrap();
        assert_eq!(mapping.slow_of(0).unwrap(), Some(9));
        let counters = AccessCounters::new(4);
        p.persist.load_counters(&p.dev, &counters, next).unwrap();
        assert_eq!(counters.get(0), 1);
    }

    #[test]
    fn test_unchanged_descriptor_is_not_rewritten() {
        let p = formatted();
        let next = p
            .persist
            .checkpoint(&p.dev, VersionFlags::default(), &p.mapping, &p.alloc, &p.counters)
            .unwrap();
        assert!(!next.super_slot());
        assert!(next.counter_copy());
    }

    #[test]
    fn test_uncommitted_checkpoint_rewrites_same_copies() {
        let p = formatted();
        p.alloc.allocate(1, &p.mapping).unwrap();
        let flags = VersionFlags::default();
        let first = p
            .persist
            .checkpoint(&p.dev, flags, &p.mapping, &p.alloc, &p.counters)
            .unwrap();

        // host never committed; a retry with the old flags must still target
        // the non-authoritative copies and rewrite the descriptor
        let second = p
            .persist
            .checkpoint(&p.dev, flags, &p.mapping, &p.alloc, &p.counters)
            .unwrap();
        assert_eq!(first, second);
        assert!(!p.persist.committed_version(0));
    }

    #[test]
    fn test_meta_reload_flag_persisted() {
        let p = formatted();
        p.persist.clear_meta_reload();
        let next = p
            .persist
            .checkpoint(&p.dev, VersionFlags::default(), &p.mapping, &p.alloc, &p.counters)
            .unwrap();
        let desc = read_descriptor(&p.dev, 4096, next.super_slot()).unwrap();
        assert!(!desc.flags.needs_meta_reload());
    }

    #[test]
    fn test_load_rejects_asymmetric_mapping() {
        let p = formatted();
        p.mapping.set(0, 3, RedirectFlags::FULL).unwrap();
        let pages = p.mapping.take_dirty_pages(true);
        let blkaddr = p.persist.layout().mpt_page_block(0, false);
        p.dev
            .write_sync(p.persist.layout().byte_offset(blkaddr), &pages[0].bytes)
            .unwrap();

        let fresh = MappingTable::new(4, 16, 1024);
        assert!(matches!(
            p.persist.load_mapping(&p.dev, &fresh),
            Err(NvmError::Corruption(_))
        ));
    }
}
