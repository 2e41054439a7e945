//! Mounted fast tier
//!
//! `NvmTier` ties together the mapping table, allocator, access counters,
//! persistence and reclamation of one fast device caching one slow device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::{Layout, Target};
use crate::allocator::SegmentAllocator;
use crate::checkpoint::{format_device, read_descriptor, MetaPersistence, VersionFlags};
use crate::device::{read_exact_at, write_all_at, SyncStorageDevice, WriteHint};
use crate::format::{FormatOptions, SuperDescriptor};
use crate::gc::{
    CollectTarget, GcConfig, GcContext, GcEngine, GcPhase, GcReport, GcWorker, WorkerConfig,
    WorkerSnapshot, WorkerState,
};
use crate::host::{GcMode, HostFilesystem};
use crate::lfu::{self, AccessCounters, TopKHeap};
use crate::mapping::{MappingTable, RedirectFlags};
use crate::redirect::{IoRequest, Redirector};
use crate::stats::{NvmStats, StatsSnapshot};
use crate::status::{NvmError, Result};

/// Blocks copied per I/O while reloading the metadata mirror
const RELOAD_CHUNK_BLOCKS: u64 = 64;

/// Options for [`NvmTier::mount`]
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Block size the descriptor was written with
    pub block_size: u32,
    /// Identity of the slow tier being mounted
    pub identity: Uuid,
    /// Selector flags from the host's last committed checkpoint
    pub version_flags: VersionFlags,
    /// Reclamation tunables
    pub gc: GcConfig,
    /// Background worker sleep policy
    pub worker: WorkerConfig,
}

impl MountOptions {
    /// Options for mounting against slow tier `identity`
    pub fn new(identity: Uuid) -> Self {
        Self {
            block_size: 4096,
            identity,
            version_flags: VersionFlags::default(),
            gc: GcConfig::default(),
            worker: WorkerConfig::default(),
        }
    }

    /// Set the block size
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the committed selector flags
    pub fn with_version_flags(mut self, flags: VersionFlags) -> Self {
        self.version_flags = flags;
        self
    }

    /// Set the reclamation config
    pub fn with_gc_config(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Set the worker config
    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

struct TierInner {
    layout: Layout,
    identity: Uuid,
    fast: Arc<dyn SyncStorageDevice>,
    slow: Arc<dyn SyncStorageDevice>,
    host: Arc<dyn HostFilesystem>,
    mapping: MappingTable,
    allocator: SegmentAllocator,
    counters: AccessCounters,
    persistence: MetaPersistence,
    engine: GcEngine,
    meta_reloaded: AtomicBool,
    stats: NvmStats,
}

impl TierInner {
    fn gc_context(&self) -> GcContext<'_> {
        GcContext {
            layout: &self.layout,
            fast: &*self.fast,
            slow: &*self.slow,
            mapping: &self.mapping,
            allocator: &self.allocator,
            counters: &self.counters,
            host: &*self.host,
            stats: &self.stats.gc,
        }
    }

    fn redirector(&self) -> Redirector<'_> {
        Redirector {
            layout: &self.layout,
            mapping: &self.mapping,
            counters: &self.counters,
            migration: self.engine.migration(),
            meta_reloaded: self.meta_reloaded.load(Ordering::Acquire),
        }
    }

    fn under_pressure(&self) -> bool {
        self.allocator
            .under_pressure(self.engine.config().free_limit_percent)
    }
}

impl CollectTarget for TierInner {
    fn is_frozen(&self) -> bool {
        self.host.is_frozen()
    }

    fn under_pressure(&self) -> bool {
        TierInner::under_pressure(self)
    }

    fn try_background_gc(&self) -> Option<Result<GcReport>> {
        self.engine
            .try_run(&self.gc_context(), GcMode::Background, true)
    }
}

/// A fast tier mounted in front of a slow tier
pub struct NvmTier {
    inner: Arc<TierInner>,
    worker: Mutex<GcWorker<TierInner>>,
}

impl NvmTier {
    /// Format `fast` with `options`.
    ///
    /// Any previous content of the fast tier is forgotten.
    pub fn format(fast: &dyn SyncStorageDevice, options: &FormatOptions) -> Result<SuperDescriptor> {
        format_device(fast, options)
    }

    /// Mount a formatted fast tier.
    ///
    /// Fails with [`NvmError::IdentityMismatch`] if the fast tier was
    /// formatted for a different slow tier.
    pub fn mount(
        fast: Arc<dyn SyncStorageDevice>,
        slow: Arc<dyn SyncStorageDevice>,
        host: Arc<dyn HostFilesystem>,
        options: MountOptions,
    ) -> Result<Self> {
        let flags = options.version_flags;
        let desc = read_descriptor(&*fast, options.block_size, flags.super_slot())?;
        if desc.identity != options.identity {
            tracing::warn!(
                fast = %desc.identity,
                slow = %options.identity,
                "fast tier belongs to another slow tier"
            );
            return Err(NvmError::IdentityMismatch {
                fast: desc.identity,
                slow: options.identity,
            });
        }

        let layout = desc.layout.clone();
        let persistence = MetaPersistence::new(&desc);
        let mapping = MappingTable::new(
            layout.fast_segments,
            layout.slow_segments,
            layout.entries_per_page(),
        );
        persistence.load_mapping(&*fast, &mapping)?;

        let allocator =
            SegmentAllocator::from_persisted(layout.fast_segments, &desc.segment_map, desc.free_segments)?;
        let counters = AccessCounters::new(layout.fast_segments);
        persistence.load_counters(&*fast, &counters, flags)?;

        reconcile(&layout, &mapping, &allocator, &counters)?;

        let meta_reloaded = !desc.flags.needs_meta_reload();
        tracing::info!(
            identity = %desc.identity,
            sequence = desc.sequence,
            mapped = mapping.mapped_count(),
            free = allocator.free(),
            meta_reloaded,
            "fast tier mounted"
        );

        let inner = Arc::new(TierInner {
            layout,
            identity: desc.identity,
            fast,
            slow,
            host,
            mapping,
            allocator,
            counters,
            persistence,
            engine: GcEngine::new(options.gc),
            meta_reloaded: AtomicBool::new(meta_reloaded),
            stats: NvmStats::new(),
        });
        let worker = GcWorker::new(Arc::downgrade(&inner), options.worker);
        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Layout of both tiers
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Identity of the slow tier
    pub fn identity(&self) -> Uuid {
        self.inner.identity
    }

    /// Mapping table
    pub fn mapping(&self) -> &MappingTable {
        &self.inner.mapping
    }

    /// Access counters
    pub fn counters(&self) -> &AccessCounters {
        &self.inner.counters
    }

    /// Free fast segments
    pub fn free_segments(&self) -> u32 {
        self.inner.allocator.free()
    }

    /// Check whether free fast segments are below the configured limit
    pub fn under_pressure(&self) -> bool {
        self.inner.under_pressure()
    }

    /// Check whether the metadata mirror has been loaded
    pub fn is_meta_reloaded(&self) -> bool {
        self.inner.meta_reloaded.load(Ordering::Acquire)
    }

    /// Cache slow segment `slow`, returning its fast segment.
    ///
    /// Fails with [`NvmError::NoSpace`] when the fast tier is full.
    pub fn allocate(&self, slow: u32) -> Result<u32> {
        let result = self.inner.allocator.allocate(slow, &self.inner.mapping);
        if matches!(result, Err(NvmError::NoSpace)) || self.inner.under_pressure() {
            self.wake_worker();
        }
        result
    }

    /// Drop the mapping of a slow segment the host has freed.
    ///
    /// Returns the fast segment that was released, if `slow` was cached.
    pub fn release_slow_segment(&self, slow: u32) -> Result<Option<u32>> {
        let inner = &self.inner;
        let _migration = inner.engine.migration().lock();
        let released = inner.gc_context().teardown_slow(slow)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(slow, fast = ?released, "slow segment released");
        }
        Ok(released)
    }

    /// Count one access to fast segment `fast`
    pub fn record_access(&self, fast: u32) -> Result<i32> {
        if fast >= self.inner.layout.fast_segments {
            return Err(NvmError::InvalidArgument(format!(
                "fast segment {fast} out of range"
            )));
        }
        Ok(self.inner.counters.record_access(fast))
    }

    /// The `k` least-accessed fast segments
    pub fn select_victims(&self, k: usize) -> TopKHeap {
        lfu::select_victims(&self.inner.counters, k)
    }

    /// Run a reclamation pass from outside the background worker.
    ///
    /// A foreground pass fails with [`NvmError::TryAgain`] if no section was
    /// freed. A background pass is only accepted when pressure forces it to
    /// run in the foreground.
    pub fn gc(&self, mode: GcMode) -> Result<GcReport> {
        self.inner.engine.run(&self.inner.gc_context(), mode, false)
    }

    /// Run a background pass unless one is already in progress
    pub fn try_background_gc(&self) -> Option<Result<GcReport>> {
        self.inner.try_background_gc()
    }

    /// Current reclamation phase
    pub fn gc_phase(&self) -> GcPhase {
        self.inner.engine.phase()
    }

    /// Write all pending metadata to the non-authoritative copies.
    ///
    /// Returns the flags the host must record in its own checkpoint before
    /// calling [`commit_snapshot`](Self::commit_snapshot).
    pub fn checkpoint(&self, flags: VersionFlags) -> Result<VersionFlags> {
        let inner = &self.inner;
        inner.persistence.checkpoint(
            &*inner.fast,
            flags,
            &inner.mapping,
            &inner.allocator,
            &inner.counters,
        )
    }

    /// Promote the last checkpoint after the host committed its flags
    pub fn commit_snapshot(&self) {
        self.inner.persistence.commit();
        self.inner.allocator.commit_snapshot();
    }

    /// Copy the slow tier's metadata range into the fast tier.
    ///
    /// Afterwards metadata reads are served from the fast tier.
    pub fn reload_metadata(&self) -> Result<()> {
        let inner = &self.inner;
        let layout = &inner.layout;
        let chunk = RELOAD_CHUNK_BLOCKS * layout.block_size as u64;
        let mut buf = Vec::new();
        let mut block = layout.meta_start;
        while block < layout.meta_end {
            let blocks = (layout.meta_end - block).min(RELOAD_CHUNK_BLOCKS);
            let len = (blocks * layout.block_size as u64).min(chunk) as usize;
            buf.resize(len, 0);
            let offset = layout.byte_offset(block);
            read_exact_at(&*inner.slow, offset, &mut buf)?;
            write_all_at(&*inner.fast, offset, &buf, WriteHint::None)?;
            block += blocks;
        }
        inner.fast.flush_sync()?;

        inner.meta_reloaded.store(true, Ordering::Release);
        inner.persistence.clear_meta_reload();
        tracing::info!(
            blocks = layout.meta_end - layout.meta_start,
            "metadata mirror reloaded"
        );
        Ok(())
    }

    /// Resolve a multi-block request
    pub fn redirect(&self, req: &IoRequest) -> Result<Target> {
        self.inner
            .redirector()
            .resolve(req, &self.inner.stats.redirect)
    }

    /// Resolve a single-block buffered request
    pub fn redirect_buffered(&self, req: &IoRequest) -> Result<Target> {
        if req.nr_blocks != 1 {
            return Err(NvmError::InvalidRequest(format!(
                "buffered request must be one block: {req}"
            )));
        }
        self.inner
            .redirector()
            .resolve(req, &self.inner.stats.buffered)
    }

    /// Start the background worker.
    ///
    /// Returns false if it was already running.
    pub fn start_worker(&self) -> Result<bool> {
        Ok(self.worker.lock().start()?)
    }

    /// Stop the background worker and wait for it
    pub fn stop_worker(&self) {
        self.worker.lock().stop();
    }

    /// Wake the background worker
    pub fn wake_worker(&self) {
        self.worker.lock().wake();
    }

    /// Skip background passes until [`resume_worker`](Self::resume_worker)
    pub fn pause_worker(&self) {
        self.worker.lock().pause();
    }

    /// Resume background passes
    pub fn resume_worker(&self) {
        self.worker.lock().resume();
    }

    /// Background worker state
    pub fn worker_state(&self) -> WorkerState {
        self.worker.lock().state()
    }

    /// Background worker statistics
    pub fn worker_stats(&self) -> WorkerSnapshot {
        self.worker.lock().stats().snapshot()
    }

    /// Statistics since mount
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop the worker and return the final statistics.
    ///
    /// Metadata is not written; take a checkpoint first to keep recent
    /// changes.
    pub fn unmount(self) -> StatsSnapshot {
        self.stop_worker();
        let stats = self.stats();
        tracing::info!(
            identity = %self.inner.identity,
            mapped = self.inner.mapping.mapped_count(),
            free = self.inner.allocator.free(),
            summary = %stats,
            "fast tier unmounted"
        );
        stats
    }
}

impl std::fmt::Debug for NvmTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmTier")
            .field("identity", &self.inner.identity)
            .field("fast_segments", &self.inner.layout.fast_segments)
            .field("free", &self.inner.allocator.free())
            .field("phase", &self.inner.engine.phase())
            .finish()
    }
}

/// Bring freshly loaded state back to a consistent picture.
///
/// Pairs caught mid-migration are fully redirected again, and fast segments
/// allocated without a mapping are freed. A mapped segment that is not
/// allocated is corruption.
fn reconcile(
    layout: &Layout,
    mapping: &MappingTable,
    allocator: &SegmentAllocator,
    counters: &AccessCounters,
) -> Result<()> {
    for fast in 0..layout.fast_segments {
        let entry = mapping.fast_entry(fast)?;
        let allocated = allocator.is_allocated(fast);
        if entry.is_mapped() {
            if !allocated {
                return Err(NvmError::Corruption(format!(
                    "fast segment {fast} mapped but not allocated"
                )));
            }
            if entry.is_migrating() {
                tracing::warn!(fast, slow = entry.target, "interrupted migration rolled back");
                mapping.set_pair_flags(fast, RedirectFlags::FULL)?;
            }
        } else {
            if allocated {
                tracing::warn!(fast, "allocated segment without mapping freed");
                allocator.release(fast)?;
            }
            counters.reset(fast);
        }
    }
    Ok(())
}
