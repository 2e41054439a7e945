//! Checkpoint and remount
//!
//! A checkpoint only writes non-authoritative copies, so whatever the host
//! last committed must stay loadable no matter where a later checkpoint
//! fails.

mod common;

use std::sync::Arc;

use nvmtier::checkpoint::VersionFlags;
use nvmtier::device::{FileSystemFile, MemDevice, SyncStorageDevice};
use nvmtier::mapping::RedirectFlags;
use nvmtier::{MountOptions, NvmError, NvmTier, Status};
use tempfile::tempdir;
use uuid::Uuid;

use common::{corrupt_byte_at, format_options, FaultInjectionDevice, Harness, MockHost, IDENTITY};

type FaultyFast = FaultInjectionDevice<MemDevice>;

struct Rig {
    fast: Arc<FaultyFast>,
    slow: Arc<MemDevice>,
    host: Arc<MockHost>,
}

impl Rig {
    fn new() -> Self {
        let fast = Arc::new(FaultInjectionDevice::new(MemDevice::new()));
        NvmTier::format(&*fast, &format_options(4)).unwrap();
        Self {
            fast,
            slow: Arc::new(MemDevice::with_size(1 << 20)),
            host: Arc::new(MockHost::full()),
        }
    }

    fn mount(&self, flags: VersionFlags) -> nvmtier::Result<NvmTier> {
        NvmTier::mount(
            self.fast.clone(),
            self.slow.clone(),
            self.host.clone(),
            MountOptions::new(IDENTITY).with_version_flags(flags),
        )
    }
}

#[test]
fn test_remount_restores_mapping_counters_and_allocation() {
    let Harness {
        fast,
        slow,
        host,
        tier,
    } = Harness::new(4);
    let a = tier.allocate(3).unwrap();
    let b = tier.allocate(9).unwrap();
    for _ in 0..3 {
        tier.record_access(a).unwrap();
    }
    tier.record_access(b).unwrap();

    let flags = tier.checkpoint(VersionFlags::default()).unwrap();
    assert!(flags.super_slot());
    assert!(flags.counter_copy());
    tier.commit_snapshot();
    tier.unmount();

    let tier = NvmTier::mount(
        fast,
        slow,
        host,
        MountOptions::new(IDENTITY).with_version_flags(flags),
    )
    .unwrap();
    assert_eq!(tier.free_segments(), 2);
    assert_eq!(tier.mapping().slow_of(a).unwrap(), Some(3));
    assert_eq!(tier.mapping().slow_of(b).unwrap(), Some(9));
    assert_eq!(tier.mapping().fast_entry(a).unwrap().flags, RedirectFlags::FULL);
    assert_eq!(tier.counters().get(a), 3);
    assert_eq!(tier.counters().get(b), 1);
    tier.mapping().check_symmetry().unwrap();

    // the next checkpoint alternates back
    let next = tier.checkpoint(flags).unwrap();
    assert_eq!(next.counter_copy(), !flags.counter_copy());
}

#[test]
fn test_identity_mismatch_is_refused() {
    let fast = Arc::new(MemDevice::new());
    NvmTier::format(&*fast, &format_options(4)).unwrap();
    let err = NvmTier::mount(
        fast,
        Arc::new(MemDevice::new()),
        Arc::new(MockHost::full()),
        MountOptions::new(Uuid::from_u128(0xdead_beef)),
    )
    .unwrap_err();
    assert!(matches!(err, NvmError::IdentityMismatch { fast, .. } if fast == IDENTITY));
    assert_eq!(err.status(), Status::Corruption);
}

#[test]
fn test_failed_descriptor_write_keeps_committed_state() {
    let rig = Rig::new();
    let tier = rig.mount(VersionFlags::default()).unwrap();
    tier.allocate(3).unwrap();
    let committed = tier.checkpoint(VersionFlags::default()).unwrap();
    tier.commit_snapshot();

    tier.allocate(5).unwrap();
    // mapping page, counters, then the descriptor fails
    rig.fast.inject_write_error_after(3);
    assert!(matches!(
        tier.checkpoint(committed),
        Err(NvmError::Io(_))
    ));
    tier.unmount();

    let tier = rig.mount(committed).unwrap();
    assert_eq!(tier.mapping().mapped_count(), 1);
    assert!(tier.mapping().slow_entry(3).unwrap().is_mapped());
    assert!(!tier.mapping().slow_entry(5).unwrap().is_mapped());
    assert_eq!(tier.free_segments(), 3);
}

#[test]
fn test_failed_flush_keeps_committed_state() {
    let rig = Rig::new();
    let tier = rig.mount(VersionFlags::default()).unwrap();
    let fast = tier.allocate(8).unwrap();
    tier.record_access(fast).unwrap();
    let committed = tier.checkpoint(VersionFlags::default()).unwrap();
    tier.commit_snapshot();

    tier.record_access(fast).unwrap();
    tier.release_slow_segment(8).unwrap();
    rig.fast.inject_flush_error();
    assert!(tier.checkpoint(committed).is_err());
    tier.unmount();

    let tier = rig.mount(committed).unwrap();
    assert_eq!(tier.mapping().slow_of(fast).unwrap(), Some(8));
    assert_eq!(tier.counters().get(fast), 1);
}

#[test]
fn test_retry_after_failure_persists_everything() {
    let rig = Rig::new();
    let tier = rig.mount(VersionFlags::default()).unwrap();
    let committed = tier.checkpoint(VersionFlags::default()).unwrap();
    tier.commit_snapshot();

    let a = tier.allocate(1).unwrap();
    let b = tier.allocate(2).unwrap();
    // the mapping page write fails
    rig.fast.inject_write_error_after(1);
    assert!(tier.checkpoint(committed).is_err());

    // re-armed: the retry writes the page again
    let flags = tier.checkpoint(committed).unwrap();
    tier.commit_snapshot();
    tier.unmount();

    let tier = rig.mount(flags).unwrap();
    assert_eq!(tier.mapping().slow_of(a).unwrap(), Some(1));
    assert_eq!(tier.mapping().slow_of(b).unwrap(), Some(2));
    assert_eq!(tier.free_segments(), 2);
}

#[test]
fn test_release_during_checkpoint_stays_mountable() {
    let rig = Rig::new();
    let tier = Arc::new(rig.mount(VersionFlags::default()).unwrap());
    let released = tier.allocate(5).unwrap();
    tier.allocate(6).unwrap();
    let committed = tier.checkpoint(VersionFlags::default()).unwrap();
    tier.commit_snapshot();

    tier.allocate(7).unwrap();
    // tear slow 5 down once the first mapping page is on disk
    let weak = Arc::downgrade(&tier);
    rig.fast.run_after_write(1, move || {
        if let Some(tier) = weak.upgrade() {
            assert_eq!(tier.release_slow_segment(5).unwrap(), Some(released));
        }
    });
    let flags = tier.checkpoint(committed).unwrap();
    tier.commit_snapshot();
    assert!(!tier.mapping().slow_entry(5).unwrap().is_mapped());

    // the checkpoint predates the release
    let remounted = rig.mount(flags).unwrap();
    assert_eq!(remounted.mapping().slow_of(released).unwrap(), Some(5));
    assert_eq!(remounted.mapping().mapped_count(), 3);
    assert_eq!(remounted.free_segments(), 1);
    remounted.mapping().check_symmetry().unwrap();
    remounted.unmount();

    // and the release is still pending for the next one
    let next = tier.checkpoint(flags).unwrap();
    assert!(next.super_slot() != flags.super_slot());
    tier.commit_snapshot();
    let remounted = rig.mount(next).unwrap();
    assert!(!remounted.mapping().slow_entry(5).unwrap().is_mapped());
    assert_eq!(remounted.mapping().mapped_count(), 2);
    assert_eq!(remounted.free_segments(), 2);
    remounted.mapping().check_symmetry().unwrap();
}

#[test]
fn test_released_segment_pinned_until_commit() {
    let h = Harness::new(4);
    let fasts: Vec<u32> = (0..4).map(|slow| h.tier.allocate(slow).unwrap()).collect();
    let flags = h.tier.checkpoint(VersionFlags::default()).unwrap();
    h.tier.commit_snapshot();

    assert_eq!(h.tier.release_slow_segment(2).unwrap(), Some(fasts[2]));
    assert_eq!(h.tier.free_segments(), 1);
    // still allocated in the committed checkpoint
    assert!(matches!(h.tier.allocate(10), Err(NvmError::NoSpace)));

    h.tier.checkpoint(flags).unwrap();
    h.tier.commit_snapshot();
    assert_eq!(h.tier.allocate(10).unwrap(), fasts[2]);
}

#[test]
fn test_corrupted_descriptor_on_file_device() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fast.img");
    let fast = Arc::new(FileSystemFile::create_with_size(&path, 0).unwrap());
    NvmTier::format(&*fast, &format_options(4)).unwrap();
    assert!(fast.size_sync().unwrap() > 0);
    drop(fast);

    corrupt_byte_at(&path, 40).unwrap();

    let mount = |flags: VersionFlags| {
        let fast = Arc::new(FileSystemFile::open(&path, false).unwrap());
        NvmTier::mount(
            fast,
            Arc::new(MemDevice::new()),
            Arc::new(MockHost::full()),
            MountOptions::new(IDENTITY).with_version_flags(flags),
        )
    };
    match mount(VersionFlags::default()) {
        Err(NvmError::Corruption(msg)) => assert!(msg.contains("checksum"), "{msg}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("corrupted descriptor mounted"),
    }

    // the other slot was written at format time too
    let tier = mount(VersionFlags::new(VersionFlags::SUPER)).unwrap();
    assert_eq!(tier.free_segments(), 4);
}
