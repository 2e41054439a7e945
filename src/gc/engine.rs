//! LFU reclamation of fast-tier segments
//!
//! A pass picks the least-frequently-accessed mapped segments and, for each,
//! either hands the slow counterpart to the host collector (few live blocks)
//! or copies the whole segment back to the slow tier and drops the mapping.

use std::io;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::address::Layout;
use crate::allocator::SegmentAllocator;
use crate::device::{read_exact_at, write_all_at, SyncStorageDevice, WriteHint};
use crate::gc::{GcPhase, GcState};
use crate::host::{GcMode, HostFilesystem};
use crate::lfu::{select_victims, AccessCounters};
use crate::mapping::{MappingTable, RedirectFlags};
use crate::stats::GcStats;
use crate::status::{NvmError, Result};
use crate::utility::PinnedBuffer;

/// Upper bound on consecutive rounds of a non-blocking pass
const MAX_ROUNDS: u32 = 64;

/// Reclamation tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Victims selected per round
    pub victim_batch: usize,
    /// Segments whose live fraction is below this percentage are delegated
    pub valid_threshold_percent: u32,
    /// Free fast segments below this percentage of the total is pressure
    pub free_limit_percent: u32,
    /// Segments per section, the unit foreground passes report in
    pub segments_per_section: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            victim_batch: 50,
            valid_threshold_percent: 30,
            free_limit_percent: 10,
            segments_per_section: 1,
        }
    }
}

impl GcConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the victim batch size
    pub fn with_victim_batch(mut self, batch: usize) -> Self {
        self.victim_batch = batch;
        self
    }

    /// Set the delegation threshold
    pub fn with_valid_threshold_percent(mut self, percent: u32) -> Self {
        self.valid_threshold_percent = percent.min(100);
        self
    }

    /// Set the free-space pressure limit
    pub fn with_free_limit_percent(mut self, percent: u32) -> Self {
        self.free_limit_percent = percent.min(100);
        self
    }

    /// Set the section size
    pub fn with_segments_per_section(mut self, segments: u32) -> Self {
        self.segments_per_section = segments.max(1);
        self
    }
}

/// Outcome of one call to [`GcEngine::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Selection rounds run
    pub rounds: u32,
    /// Victims considered
    pub victims: u32,
    /// Segments copied back to the slow tier
    pub migrated: u32,
    /// Segments handed to the host collector
    pub delegated: u32,
    /// Victims skipped
    pub skipped: u32,
    /// Segments freed
    pub freed_segments: u32,
    /// Sections fully freed while accounting in foreground mode
    pub freed_sections: u32,
}

/// Mutex naming the fast segment currently being migrated.
///
/// Writers that find a segment mid-migration block here until it is done.
#[derive(Debug, Default)]
pub struct MigrationLock {
    current: Mutex<Option<u32>>,
}

impl MigrationLock {
    /// Create an unlocked instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast segment being migrated right now, if any
    pub fn current(&self) -> Option<u32> {
        *self.current.lock()
    }

    /// Block until no migration is in progress
    pub fn wait(&self) {
        drop(self.current.lock());
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<u32>> {
        self.current.lock()
    }
}

/// Borrowed view of the tier state a pass works on
pub(crate) struct GcContext<'a> {
    pub(crate) layout: &'a Layout,
    pub(crate) fast: &'a dyn SyncStorageDevice,
    pub(crate) slow: &'a dyn SyncStorageDevice,
    pub(crate) mapping: &'a MappingTable,
    pub(crate) allocator: &'a SegmentAllocator,
    pub(crate) counters: &'a AccessCounters,
    pub(crate) host: &'a dyn HostFilesystem,
    pub(crate) stats: &'a GcStats,
}

impl GcContext<'_> {
    /// Drop the mapping of `fast` and return it to the free pool.
    pub(crate) fn teardown(&self, fast: u32) -> Result<u32> {
        let slow = self.mapping.clear_pair(fast)?;
        self.counters.reset(fast);
        self.allocator.release(fast)?;
        self.stats.record_freed(1);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                fast,
                slow,
                free = self.allocator.free(),
                "mapping torn down"
            );
        }
        Ok(slow)
    }

    /// Tear down whatever fast segment `slow` maps to, if any
    pub(crate) fn teardown_slow(&self, slow: u32) -> Result<Option<u32>> {
        let entry = self.mapping.slow_entry(slow)?;
        if !entry.is_mapped() {
            return Ok(None);
        }
        self.teardown(entry.target).map(|_| Some(entry.target))
    }

    fn under_pressure(&self, config: &GcConfig) -> bool {
        self.allocator.under_pressure(config.free_limit_percent)
    }
}

enum Decision {
    Skip,
    Delegate(u32),
    Migrate,
}

/// One reclamation pass at a time, plus the migration lock writers wait on
#[derive(Debug)]
pub struct GcEngine {
    config: GcConfig,
    // Serializes passes and owns the migration scratch buffer.
    gate: Mutex<Option<PinnedBuffer>>,
    migration: MigrationLock,
    state: GcState,
}

impl GcEngine {
    /// Create an engine with `config`
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            gate: Mutex::new(None),
            migration: MigrationLock::new(),
            state: GcState::new(),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Current pass phase
    pub fn phase(&self) -> GcPhase {
        self.state.phase()
    }

    /// Migration lock shared with the redirector
    pub fn migration(&self) -> &MigrationLock {
        &self.migration
    }

    /// Run a pass, waiting for any pass already in progress.
    ///
    /// `background` tells whether the caller is the background worker.
    pub(crate) fn run(
        &self,
        ctx: &GcContext<'_>,
        mode: GcMode,
        background: bool,
    ) -> Result<GcReport> {
        let mut gate = self.gate.lock();
        self.run_locked(ctx, &mut gate, mode, background)
    }

    /// Run a pass unless one is already in progress
    pub(crate) fn try_run(
        &self,
        ctx: &GcContext<'_>,
        mode: GcMode,
        background: bool,
    ) -> Option<Result<GcReport>> {
        let mut gate = self.gate.try_lock()?;
        Some(self.run_locked(ctx, &mut gate, mode, background))
    }

    fn run_locked(
        &self,
        ctx: &GcContext<'_>,
        buffer: &mut Option<PinnedBuffer>,
        mode: GcMode,
        background: bool,
    ) -> Result<GcReport> {
        let start = Instant::now();
        let sync = mode == GcMode::Foreground;
        let mut effective = mode;
        let mut report = GcReport::default();

        let outcome = loop {
            if effective == GcMode::Background && ctx.under_pressure(&self.config) {
                if ctx.host.prefree_segments() > 0 {
                    if let Err(err) = ctx.host.write_checkpoint() {
                        break Err(err);
                    }
                }
                if ctx.under_pressure(&self.config) {
                    effective = GcMode::Foreground;
                }
            }
            if effective == GcMode::Background && !background {
                break Err(NvmError::InvalidArgument(
                    "background pass requested outside the worker".into(),
                ));
            }

            let freed_before = report.freed_segments;
            match self.round(ctx, buffer, effective, &mut report) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }

            if sync
                || !ctx.under_pressure(&self.config)
                || report.freed_segments == freed_before
                || report.rounds >= MAX_ROUNDS
            {
                break Ok(());
            }
        };
        self.state.reset();
        ctx.stats.record_pass(start.elapsed());

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                %mode,
                rounds = report.rounds,
                migrated = report.migrated,
                delegated = report.delegated,
                skipped = report.skipped,
                freed = report.freed_segments,
                free = ctx.allocator.free(),
                "gc pass finished"
            );
        }

        outcome?;
        if sync && report.freed_sections == 0 {
            return Err(NvmError::TryAgain);
        }
        Ok(report)
    }

    /// Select a batch of victims and process them.
    ///
    /// Returns false when no victim was found.
    fn round(
        &self,
        ctx: &GcContext<'_>,
        buffer: &mut Option<PinnedBuffer>,
        mode: GcMode,
        report: &mut GcReport,
    ) -> Result<bool> {
        self.state.advance(GcPhase::SelectingVictims);
        report.rounds += 1;
        let victims = select_victims(ctx.counters, self.config.victim_batch).into_ascending();
        if victims.is_empty() {
            self.state.advance(GcPhase::Idle);
            return Ok(false);
        }

        for victim in victims {
            self.state.advance(GcPhase::PerVictimDecision);
            report.victims += 1;

            let freed = match self.decide(ctx, victim.segment)? {
                Decision::Skip => {
                    report.skipped += 1;
                    ctx.stats.record_skip();
                    continue;
                }
                Decision::Delegate(slow) => {
                    self.state.advance(GcPhase::DelegatedReclaim);
                    report.delegated += 1;
                    self.delegate(ctx, victim.segment, slow, mode)?
                }
                Decision::Migrate => {
                    let freed = self.migrate_section(ctx, buffer, victim.segment)?;
                    report.migrated += freed;
                    freed
                }
            };

            if mode == GcMode::Foreground && freed == self.config.segments_per_section {
                report.freed_sections += 1;
            }
            report.freed_segments += freed;
        }
        self.state.advance(GcPhase::Idle);
        Ok(true)
    }

    fn decide(&self, ctx: &GcContext<'_>, fast: u32) -> Result<Decision> {
        let Some(slow) = ctx.mapping.slow_of(fast)? else {
            // Stray count on an unmapped segment.
            ctx.counters.reset(fast);
            return Ok(Decision::Skip);
        };
        if ctx.host.is_segment_busy(slow) {
            return Ok(Decision::Skip);
        }
        let valid = ctx.host.valid_blocks(slow);
        if valid == 0 {
            return Ok(Decision::Skip);
        }
        let bps = ctx.layout.blocks_per_segment as u64;
        if (valid as u64) < bps * self.config.valid_threshold_percent as u64 / 100 {
            return Ok(Decision::Delegate(slow));
        }
        Ok(Decision::Migrate)
    }

    fn delegate(&self, ctx: &GcContext<'_>, fast: u32, slow: u32, mode: GcMode) -> Result<u32> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(fast, slow, %mode, "delegating victim to host collector");
        }
        let freed = ctx.host.reclaim_segment(slow, mode)?;
        ctx.stats.record_delegation();
        if freed > 0 {
            self.state.advance(GcPhase::MappingTeardown);
            // The host may already have released it.
            ctx.teardown_slow(slow)?;
        }
        Ok(freed)
    }

    /// Migrate the section of fast segments starting at `first`
    fn migrate_section(
        &self,
        ctx: &GcContext<'_>,
        buffer: &mut Option<PinnedBuffer>,
        first: u32,
    ) -> Result<u32> {
        let end = first
            .saturating_add(self.config.segments_per_section)
            .min(ctx.layout.fast_segments);
        let mut freed = 0;
        for fast in first..end {
            let Some(slow) = ctx.mapping.slow_of(fast)? else {
                continue;
            };
            self.state.advance(GcPhase::SegmentMigration);
            let scratch = self.scratch(ctx, buffer)?;
            self.migrate(ctx, scratch, fast, slow)?;
            freed += 1;
        }
        Ok(freed)
    }

    fn scratch<'b>(
        &self,
        ctx: &GcContext<'_>,
        buffer: &'b mut Option<PinnedBuffer>,
    ) -> Result<&'b mut PinnedBuffer> {
        let half = (ctx.layout.segment_bytes() / 2) as usize;
        if buffer.as_ref().map(PinnedBuffer::size) != Some(half) {
            let alignment = ctx.fast.alignment().max(ctx.slow.alignment());
            *buffer = Some(PinnedBuffer::zeroed(alignment, half).ok_or_else(|| {
                NvmError::Io(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("cannot allocate a {half} byte migration buffer"),
                ))
            })?);
        }
        buffer
            .as_mut()
            .ok_or_else(|| NvmError::invariant("migration buffer missing"))
    }

    /// Copy fast segment `fast` back to slow segment `slow` and unmap it.
    ///
    /// On an I/O error the pair is restored to fully redirected and left
    /// mapped.
    pub(crate) fn migrate(
        &self,
        ctx: &GcContext<'_>,
        scratch: &mut PinnedBuffer,
        fast: u32,
        slow: u32,
    ) -> Result<()> {
        let mut current = self.migration.lock();
        *current = Some(fast);
        let result = self.migrate_locked(ctx, scratch, fast, slow);
        *current = None;
        result
    }

    fn migrate_locked(
        &self,
        ctx: &GcContext<'_>,
        scratch: &mut PinnedBuffer,
        fast: u32,
        slow: u32,
    ) -> Result<()> {
        ctx.mapping.set_pair_flags(fast, RedirectFlags::MIGRATING)?;

        if let Err(source) = copy_segment(ctx, scratch, fast, slow) {
            ctx.stats.record_failure();
            tracing::warn!(fast, slow, error = %source, "segment migration failed");
            ctx.mapping.set_pair_flags(fast, RedirectFlags::FULL)?;
            return Err(NvmError::MigrationFailed { fast, slow, source });
        }

        self.state.advance(GcPhase::MappingTeardown);
        ctx.teardown(fast)?;
        ctx.stats.record_migration(ctx.layout.segment_bytes());
        Ok(())
    }
}

/// Copy one segment in two halves through `scratch`
fn copy_segment(
    ctx: &GcContext<'_>,
    scratch: &mut PinnedBuffer,
    fast: u32,
    slow: u32,
) -> io::Result<()> {
    let layout = ctx.layout;
    let half = scratch.size() as u64;
    let src = layout.byte_offset(layout.fast_segment_start(fast));
    let dst = layout.byte_offset(layout.slow_segment_start(slow));
    for part in 0..2 {
        let buf = scratch.as_mut_slice();
        read_exact_at(ctx.fast, src + part * half, buf)?;
        write_all_at(ctx.slow, dst + part * half, buf, WriteHint::Warm)?;
    }
    ctx.slow.flush_sync()
}
