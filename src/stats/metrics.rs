//! Statistics metrics definitions

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::redirect::{IoOp, PageType};

#[derive(Debug, Default)]
struct CategoryCounters {
    redirected_bios: AtomicU64,
    redirected_blocks: AtomicU64,
    direct_bios: AtomicU64,
    direct_blocks: AtomicU64,
}

impl CategoryCounters {
    fn snapshot(&self) -> CategorySnapshot {
        CategorySnapshot {
            redirected_bios: self.redirected_bios.load(Ordering::Relaxed),
            redirected_blocks: self.redirected_blocks.load(Ordering::Relaxed),
            direct_bios: self.direct_bios.load(Ordering::Relaxed),
            direct_blocks: self.direct_blocks.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.redirected_bios.store(0, Ordering::Relaxed);
        self.redirected_blocks.store(0, Ordering::Relaxed);
        self.direct_bios.store(0, Ordering::Relaxed);
        self.direct_blocks.store(0, Ordering::Relaxed);
    }
}

/// Request counters per page type and direction
#[derive(Debug, Default)]
pub struct RedirectStats {
    // [page type][op]
    categories: [[CategoryCounters; 2]; 3],
}

impl RedirectStats {
    /// Create zeroed stats
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: PageType, op: IoOp) -> &CategoryCounters {
        &self.categories[kind as usize][op as usize]
    }

    /// Record one request of `blocks` blocks
    #[inline]
    pub fn record(&self, kind: PageType, op: IoOp, redirected: bool, blocks: u32) {
        let slot = self.slot(kind, op);
        if redirected {
            slot.redirected_bios.fetch_add(1, Ordering::Relaxed);
            slot.redirected_blocks
                .fetch_add(blocks as u64, Ordering::Relaxed);
        } else {
            slot.direct_bios.fetch_add(1, Ordering::Relaxed);
            slot.direct_blocks.fetch_add(blocks as u64, Ordering::Relaxed);
        }
    }

    /// Snapshot all categories
    pub fn snapshot(&self) -> RedirectSnapshot {
        let mut out = RedirectSnapshot::default();
        for kind in PageType::ALL {
            for op in IoOp::ALL {
                out.categories[kind as usize][op as usize] = self.slot(kind, op).snapshot();
            }
        }
        out
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.categories.iter().flatten().for_each(CategoryCounters::reset);
    }
}

/// Counters of one (page type, direction) category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorySnapshot {
    /// Requests sent to the fast tier
    pub redirected_bios: u64,
    /// Blocks sent to the fast tier
    pub redirected_blocks: u64,
    /// Requests left on the slow tier
    pub direct_bios: u64,
    /// Blocks left on the slow tier
    pub direct_blocks: u64,
}

/// Snapshot of [`RedirectStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectSnapshot {
    categories: [[CategorySnapshot; 2]; 3],
}

impl RedirectSnapshot {
    /// Counters of one category
    pub fn get(&self, kind: PageType, op: IoOp) -> CategorySnapshot {
        self.categories[kind as usize][op as usize]
    }

    /// Requests redirected across all categories
    pub fn total_redirected(&self) -> u64 {
        self.categories
            .iter()
            .flatten()
            .map(|c| c.redirected_bios)
            .sum()
    }

    /// Requests left on the slow tier across all categories
    pub fn total_direct(&self) -> u64 {
        self.categories.iter().flatten().map(|c| c.direct_bios).sum()
    }
}

/// Reclamation counters
#[derive(Debug, Default)]
pub struct GcStats {
    /// Completed passes
    pub passes: AtomicU64,
    /// Segments copied back to the slow tier
    pub migrated_segments: AtomicU64,
    /// Segments handed to the host's collector
    pub delegated_segments: AtomicU64,
    /// Victims skipped as busy, empty or unmapped
    pub skipped_victims: AtomicU64,
    /// Failed migrations
    pub failures: AtomicU64,
    /// Fast segments freed
    pub freed_segments: AtomicU64,
    /// Bytes copied back to the slow tier
    pub bytes_migrated: AtomicU64,
    /// Total pass time in nanoseconds
    pub total_pass_ns: AtomicU64,
}

impl GcStats {
    /// Record a finished pass
    pub fn record_pass(&self, elapsed: Duration) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.total_pass_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a migrated segment
    pub fn record_migration(&self, bytes: u64) {
        self.migrated_segments.fetch_add(1, Ordering::Relaxed);
        self.bytes_migrated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a delegated segment
    pub fn record_delegation(&self) {
        self.delegated_segments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped victim
    pub fn record_skip(&self) {
        self.skipped_victims.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed migration
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record freed segments
    pub fn record_freed(&self, segments: u64) {
        self.freed_segments.fetch_add(segments, Ordering::Relaxed);
    }

    /// Snapshot the counters
    pub fn snapshot(&self) -> GcSnapshot {
        let passes = self.passes.load(Ordering::Relaxed);
        let total_ns = self.total_pass_ns.load(Ordering::Relaxed);
        GcSnapshot {
            passes,
            migrated_segments: self.migrated_segments.load(Ordering::Relaxed),
            delegated_segments: self.delegated_segments.load(Ordering::Relaxed),
            skipped_victims: self.skipped_victims.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            freed_segments: self.freed_segments.load(Ordering::Relaxed),
            bytes_migrated: self.bytes_migrated.load(Ordering::Relaxed),
            average_pass: if passes == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(total_ns / passes)
            },
        }
    }
}

/// Snapshot of [`GcStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcSnapshot {
    /// Completed passes
    pub passes: u64,
    /// Segments copied back
    pub migrated_segments: u64,
    /// Segments handed to the host
    pub delegated_segments: u64,
    /// Victims skipped
    pub skipped_victims: u64,
    /// Failed migrations
    pub failures: u64,
    /// Fast segments freed
    pub freed_segments: u64,
    /// Bytes copied back
    pub bytes_migrated: u64,
    /// Mean pass duration
    pub average_pass: Duration,
}

/// All statistics of a mounted tier
#[derive(Debug)]
pub struct NvmStats {
    /// Multi-block requests
    pub redirect: RedirectStats,
    /// Single-block buffered requests
    pub buffered: RedirectStats,
    /// Reclamation
    pub gc: GcStats,
    start_time: Instant,
}

impl Default for NvmStats {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self {
            redirect: RedirectStats::new(),
            buffered: RedirectStats::new(),
            gc: GcStats::default(),
            start_time: Instant::now(),
        }
    }

    /// Snapshot everything
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed: self.start_time.elapsed(),
            redirect: self.redirect.snapshot(),
            buffered: self.buffered.snapshot(),
            gc: self.gc.snapshot(),
        }
    }
}

/// Point-in-time copy of [`NvmStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Time since mount
    pub elapsed: Duration,
    /// Multi-block requests
    pub redirect: RedirectSnapshot,
    /// Single-block buffered requests
    pub buffered: RedirectSnapshot,
    /// Reclamation
    pub gc: GcSnapshot,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "elapsed: {:.2?}", self.elapsed)?;
        for (label, snap) in [("bio", &self.redirect), ("buffered", &self.buffered)] {
            for kind in PageType::ALL {
                for op in IoOp::ALL {
                    let c = snap.get(kind, op);
                    if c.redirected_bios + c.direct_bios == 0 {
                        continue;
                    }
                    writeln!(
                        f,
                        "{label} {kind} {op}: fast {} ({} blocks), slow {} ({} blocks)",
                        c.redirected_bios, c.redirected_blocks, c.direct_bios, c.direct_blocks
                    )?;
                }
            }
        }
        write!(
            f,
            "gc: passes={} migrated={} delegated={} skipped={} failures={} freed={}",
            self.gc.passes,
            self.gc.migrated_segments,
            self.gc.delegated_segments,
            self.gc.skipped_victims,
            self.gc.failures,
            self.gc.freed_segments
        )
    }
}
