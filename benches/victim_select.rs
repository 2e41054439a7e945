//! Benchmarks for the hot paths of nvmtier
//!
//! - LFU victim selection over realistic counter distributions
//! - Request redirection for mapped and unmapped segments
//! - A full foreground reclamation pass on in-memory devices

use std::sync::Arc;
use std::time::Duration;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::prelude::*;
use uuid::Uuid;

use nvmtier::device::MemDevice;
use nvmtier::format::FormatOptions;
use nvmtier::host::{GcMode, HostFilesystem};
use nvmtier::lfu::{select_victims, AccessCounters};
use nvmtier::redirect::{IoRequest, PageType};
use nvmtier::{MountOptions, NvmTier, Result};

// =============================================================================
// Helper Functions
// =============================================================================

const IDENTITY: Uuid = Uuid::from_u128(0xbe7c);
const BLOCKS_PER_SEGMENT: u32 = 64;

/// Host where every segment is fully live and never busy
struct LiveHost;

impl HostFilesystem for LiveHost {
    fn is_segment_busy(&self, _slow: u32) -> bool {
        false
    }

    fn valid_blocks(&self, _slow: u32) -> u32 {
        BLOCKS_PER_SEGMENT
    }

    fn reclaim_segment(&self, _slow: u32, _mode: GcMode) -> Result<u32> {
        Ok(1)
    }

    fn prefree_segments(&self) -> u32 {
        0
    }

    fn write_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn is_frozen(&self) -> bool {
        false
    }
}

/// Counters skewed like real access: a few hot segments, a long cold tail
fn skewed_counters(len: u32) -> Vec<i32> {
    let mut rng = StdRng::seed_from_u64(len as u64);
    (0..len)
        .map(|_| match rng.gen_range(0..100) {
            0..=9 => 0,
            10..=79 => rng.gen_range(1..64),
            _ => rng.gen_range(1_000..1_000_000),
        })
        .collect()
}

/// Mount a tier with `fast_segments` segments, all mapped
fn create_tier(fast_segments: u32, blocks_per_segment: u32) -> NvmTier {
    let slow_segments = fast_segments * 4;
    let fast = Arc::new(MemDevice::new());
    let options = FormatOptions::new(fast_segments, slow_segments)
        .with_blocks_per_segment(blocks_per_segment)
        .with_slow_main_blkaddr(1024)
        .with_meta_range(2, 512)
        .with_identity(IDENTITY);
    NvmTier::format(&*fast, &options).unwrap();

    let slow_bytes = (1024 + slow_segments as u64 * blocks_per_segment as u64) * 4096;
    let slow = Arc::new(MemDevice::with_size(slow_bytes));
    let tier = NvmTier::mount(fast, slow, Arc::new(LiveHost), MountOptions::new(IDENTITY)).unwrap();
    for i in 0..fast_segments {
        tier.allocate(i * 4).unwrap();
    }
    tier
}

// =============================================================================
// Victim Selection
// =============================================================================

fn bench_select_victims(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_victims");
    group.measurement_time(Duration::from_secs(5));

    for &segments in &[1_024u32, 16_384, 131_072] {
        let counters = AccessCounters::from_values(&skewed_counters(segments));
        group.throughput(Throughput::Elements(segments as u64));
        for &k in &[1usize, 50, 512] {
            group.bench_with_input(
                BenchmarkId::new(format!("k{k}"), segments),
                &k,
                |b, &k| b.iter(|| select_victims(black_box(&counters), k)),
            );
        }
    }

    group.finish();
}

fn bench_select_after_overflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_after_overflow");
    let mut values = skewed_counters(16_384);
    values[8_000] = -1;

    group.bench_function("halve_and_rescan", |b| {
        b.iter_batched(
            || AccessCounters::from_values(&values),
            |counters| select_victims(&counters, 50),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

// =============================================================================
// Redirection
// =============================================================================

fn bench_redirect(c: &mut Criterion) {
    let mut group = c.benchmark_group("redirect");
    group.throughput(Throughput::Elements(1));

    let tier = create_tier(256, 8);
    let layout = tier.layout().clone();
    let mut rng = rand::thread_rng();

    group.bench_function("mapped_read", |b| {
        b.iter(|| {
            let slow = rng.gen_range(0..256) * 4;
            let block = layout.slow_segment_start(slow) + rng.gen_range(0..8);
            tier.redirect(black_box(&IoRequest::read(PageType::Data, block, 1)))
        })
    });

    group.bench_function("unmapped_write", |b| {
        b.iter(|| {
            let slow = rng.gen_range(0..256) * 4 + 1;
            let block = layout.slow_segment_start(slow);
            tier.redirect(black_box(&IoRequest::write(PageType::Node, block, 8)))
        })
    });

    group.bench_function("meta_write", |b| {
        b.iter(|| tier.redirect(black_box(&IoRequest::write(PageType::Meta, 100, 4))))
    });

    group.finish();
}

// =============================================================================
// Reclamation
// =============================================================================

fn bench_foreground_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("foreground_pass");
    group.sample_size(20);

    for &segments in &[16u32, 64] {
        group.throughput(Throughput::Bytes(
            segments as u64 * BLOCKS_PER_SEGMENT as u64 * 4096,
        ));
        group.bench_with_input(
            BenchmarkId::from_parameter(segments),
            &segments,
            |b, &segments| {
                b.iter_batched(
                    || {
                        let tier = create_tier(segments, BLOCKS_PER_SEGMENT);
                        for fast in 0..segments {
                            tier.record_access(fast).unwrap();
                        }
                        tier
                    },
                    |tier| tier.gc(GcMode::Foreground).unwrap(),
                    BatchSize::PerIteration,
                )
            },
        );
    }

    group.finish();
}

criterion_group!(
    name = selection_benches;
    config = Criterion::default();
    targets = bench_select_victims, bench_select_after_overflow
);

criterion_group!(
    name = io_benches;
    config = Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(3));
    targets = bench_redirect, bench_foreground_pass
);

criterion_main!(selection_benches, io_benches);
