//! End-to-end reclamation scenario
//!
//! Four fast segments, two mapped slow segments with different access
//! frequencies, and one foreground pass over both.

mod common;

use nvmtier::gc::{GcConfig, GcPhase};
use nvmtier::host::GcMode;
use nvmtier::redirect::{IoRequest, PageType};
use nvmtier::MountOptions;

use common::{Harness, BLOCKS_PER_SEGMENT, IDENTITY};

fn harness() -> Harness {
    Harness::with_options(
        4,
        MountOptions::new(IDENTITY).with_gc_config(GcConfig::new().with_victim_batch(2)),
    )
}

/// Map slow 10 and 11, then read fast0 five times and fast1 twice.
fn populate(h: &Harness) -> (u32, u32) {
    let fast0 = h.tier.allocate(10).unwrap();
    let fast1 = h.tier.allocate(11).unwrap();
    assert_eq!((fast0, fast1), (0, 1));
    assert_eq!(h.tier.free_segments(), 2);

    for _ in 0..5 {
        let t = h
            .tier
            .redirect(&IoRequest::read(PageType::Data, h.slow_block(10), 1))
            .unwrap();
        assert!(t.is_fast());
    }
    for _ in 0..2 {
        let t = h
            .tier
            .redirect(&IoRequest::read(PageType::Node, h.slow_block(11) + 4, 2))
            .unwrap();
        assert!(t.is_fast());
    }
    assert_eq!(h.tier.counters().get(fast0), 5);
    assert_eq!(h.tier.counters().get(fast1), 2);
    (fast0, fast1)
}

#[test]
fn test_less_frequent_segment_processed_first() {
    let h = harness();
    populate(&h);
    // few live blocks: both victims go to the host, in processing order
    h.host.set_valid(10, 1);
    h.host.set_valid(11, 1);

    let report = h.tier.gc(GcMode::Foreground).unwrap();
    assert_eq!(report.victims, 2);
    assert_eq!(report.delegated, 2);
    assert_eq!(h.host.reclaimed(), vec![11, 10]);
    assert_eq!(h.tier.free_segments(), 4);
}

#[test]
fn test_migration_restores_free_count() {
    let h = harness();
    let (fast0, fast1) = populate(&h);
    h.fill_fast(fast0, 0x10);
    h.fill_fast(fast1, 0x11);

    let report = h.tier.gc(GcMode::Foreground).unwrap();
    assert_eq!(report.migrated, 2);
    assert_eq!(report.freed_segments, 2);
    assert_eq!(report.freed_sections, 2);
    assert_eq!(h.tier.free_segments(), 4);
    assert_eq!(h.tier.gc_phase(), GcPhase::Idle);

    assert!(h.slow_segment(10).iter().all(|&b| b == 0x10));
    assert!(h.slow_segment(11).iter().all(|&b| b == 0x11));
    assert_eq!(h.slow.warm_writes(), 4);

    // nothing is mapped any more, so requests stay on the slow tier
    assert_eq!(h.tier.mapping().mapped_count(), 0);
    for slow in [10, 11] {
        let block = h.slow_block(slow) + BLOCKS_PER_SEGMENT as u64 - 1;
        let t = h
            .tier
            .redirect(&IoRequest::write(PageType::Data, block, 1))
            .unwrap();
        assert!(!t.is_fast());
        assert_eq!(t.block, block);
    }
    assert_eq!(h.tier.counters().get(fast0), 0);
    assert_eq!(h.tier.counters().get(fast1), 0);

    let stats = h.tier.stats();
    assert_eq!(stats.gc.migrated_segments, 2);
    assert_eq!(stats.redirect.total_redirected(), 7);
}

#[test]
fn test_second_pass_has_nothing_to_do() {
    let h = harness();
    populate(&h);
    h.tier.gc(GcMode::Foreground).unwrap();
    assert!(matches!(
        h.tier.gc(GcMode::Foreground),
        Err(nvmtier::NvmError::TryAgain)
    ));
}
