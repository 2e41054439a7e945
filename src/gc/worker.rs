//! Background reclamation worker
//!
//! One thread per mounted tier. It sleeps on a wake channel with a timeout,
//! and on every wakeup runs a background pass if the fast tier is short of
//! free segments and no other pass holds the gate.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::gc::GcReport;
use crate::status::Result;

/// Sleep policy of the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Initial and minimum wait between wakeups
    pub min_sleep: Duration,
    /// Cap for the wait while the host is frozen
    pub max_sleep: Duration,
    /// Wait after a pass that freed nothing
    pub no_gc_sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_sleep: Duration::from_secs(30),
            max_sleep: Duration::from_secs(60),
            no_gc_sleep: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum sleep
    pub fn with_min_sleep(mut self, sleep: Duration) -> Self {
        self.min_sleep = sleep;
        self
    }

    /// Set the maximum sleep
    pub fn with_max_sleep(mut self, sleep: Duration) -> Self {
        self.max_sleep = sleep;
        self
    }

    /// Set the sleep after an unproductive pass
    pub fn with_no_gc_sleep(mut self, sleep: Duration) -> Self {
        self.no_gc_sleep = sleep;
        self
    }

    fn increase(&self, wait: Duration) -> Duration {
        (wait + self.min_sleep).min(self.max_sleep.max(self.min_sleep))
    }
}

/// What the worker needs from a mounted tier
pub trait CollectTarget: Send + Sync + 'static {
    /// Check whether the host is frozen for writes
    fn is_frozen(&self) -> bool;

    /// Check whether free fast segments are below the limit
    fn under_pressure(&self) -> bool;

    /// Run a background pass unless one is already running
    fn try_background_gc(&self) -> Option<Result<GcReport>>;
}

/// Worker statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Wakeups, by timeout or signal
    pub wakeups: AtomicU64,
    /// Passes run
    pub passes: AtomicU64,
    /// Passes that returned an error
    pub failures: AtomicU64,
    /// Wakeups skipped because the host was frozen
    pub frozen_skips: AtomicU64,
    /// Wakeups skipped because another pass held the gate
    pub busy_skips: AtomicU64,
    /// Segments freed by the worker
    pub freed_segments: AtomicU64,
}

impl WorkerStats {
    /// Snapshot the counters
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            wakeups: self.wakeups.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            frozen_skips: self.frozen_skips.load(Ordering::Relaxed),
            busy_skips: self.busy_skips.load(Ordering::Relaxed),
            freed_segments: self.freed_segments.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`WorkerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Wakeups
    pub wakeups: u64,
    /// Passes run
    pub passes: u64,
    /// Failed passes
    pub failures: u64,
    /// Frozen skips
    pub frozen_skips: u64,
    /// Busy skips
    pub busy_skips: u64,
    /// Segments freed
    pub freed_segments: u64,
}

/// State of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Worker is stopped
    Stopped = 0,
    /// Worker is waiting for the next wakeup
    Idle = 1,
    /// Worker is running a pass
    Collecting = 2,
    /// Worker is paused
    Paused = 3,
}

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            1 => WorkerState::Idle,
            2 => WorkerState::Collecting,
            3 => WorkerState::Paused,
            _ => WorkerState::Stopped,
        }
    }
}

enum Signal {
    Wake,
    Shutdown,
}

struct Shared {
    running: AtomicBool,
    paused: AtomicBool,
    state: AtomicU8,
    stats: WorkerStats,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Background reclamation worker
pub struct GcWorker<T: CollectTarget> {
    config: WorkerConfig,
    target: Weak<T>,
    shared: Arc<Shared>,
    wake: Option<Sender<Signal>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: CollectTarget> GcWorker<T> {
    /// Create a stopped worker for `target`
    pub fn new(target: Weak<T>, config: WorkerConfig) -> Self {
        Self {
            config,
            target,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                state: AtomicU8::new(WorkerState::Stopped as u8),
                stats: WorkerStats::default(),
            }),
            wake: None,
            handle: None,
        }
    }

    /// Get the current state
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.shared.state.load(Ordering::Acquire))
    }

    /// Check if the worker thread is running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Get the statistics
    pub fn stats(&self) -> &WorkerStats {
        &self.shared.stats
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the worker thread.
    ///
    /// Returns false if it is already running.
    pub fn start(&mut self) -> std::io::Result<bool> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let (tx, rx) = channel::unbounded();
        let shared = Arc::clone(&self.shared);
        let target = self.target.clone();
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("nvmtier-gc".into())
            .spawn(move || worker_loop(shared, target, config, rx));
        match spawned {
            Ok(handle) => {
                self.wake = Some(tx);
                self.handle = Some(handle);
                tracing::info!("gc worker started");
                Ok(true)
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Signal the worker to stop and wait for it
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(tx) = self.wake.take() {
            let _ = tx.send(Signal::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("gc worker panicked");
            }
            tracing::info!("gc worker stopped");
        }
        self.shared.set_state(WorkerState::Stopped);
    }

    /// Wake the worker now
    pub fn wake(&self) {
        if let Some(tx) = &self.wake {
            let _ = tx.send(Signal::Wake);
        }
    }

    /// Skip passes until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        self.shared.set_state(WorkerState::Paused);
    }

    /// Resume after [`pause`](Self::pause)
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        if self.is_running() {
            self.shared.set_state(WorkerState::Idle);
        }
    }
}

impl<T: CollectTarget> Drop for GcWorker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<T: CollectTarget>(
    shared: Arc<Shared>,
    target: Weak<T>,
    config: WorkerConfig,
    rx: Receiver<Signal>,
) {
    let stats = &shared.stats;
    let mut wait = config.min_sleep;
    shared.set_state(WorkerState::Idle);

    while shared.running.load(Ordering::Acquire) {
        match rx.recv_timeout(wait) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        stats.wakeups.fetch_add(1, Ordering::Relaxed);

        if shared.paused.load(Ordering::Acquire) {
            shared.set_state(WorkerState::Paused);
            continue;
        }

        let Some(target) = target.upgrade() else {
            break;
        };

        if target.is_frozen() {
            stats.frozen_skips.fetch_add(1, Ordering::Relaxed);
            wait = config.increase(wait);
            continue;
        }

        if !target.under_pressure() {
            wait = config.min_sleep;
            continue;
        }

        shared.set_state(WorkerState::Collecting);
        match target.try_background_gc() {
            None => {
                stats.busy_skips.fetch_add(1, Ordering::Relaxed);
            }
            Some(Ok(report)) => {
                stats.passes.fetch_add(1, Ordering::Relaxed);
                stats
                    .freed_segments
                    .fetch_add(report.freed_segments as u64, Ordering::Relaxed);
                wait = if report.freed_segments == 0 {
                    config.no_gc_sleep
                } else {
                    config.min_sleep
                };
            }
            Some(Err(err)) => {
                stats.passes.fetch_add(1, Ordering::Relaxed);
                stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "background gc pass failed");
                wait = config.min_sleep;
            }
        }
        drop(target);

        if !shared.paused.load(Ordering::Acquire) {
            shared.set_state(WorkerState::Idle);
        }
    }

    shared.set_state(WorkerState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeTarget {
        frozen: AtomicBool,
        pressure: AtomicBool,
        passes: AtomicU64,
    }

    impl CollectTarget for FakeTarget {
        fn is_frozen(&self) -> bool {
            self.frozen.load(Ordering::Acquire)
        }

        fn under_pressure(&self) -> bool {
            self.pressure.load(Ordering::Acquire)
        }

        fn try_background_gc(&self) -> Option<Result<GcReport>> {
            self.passes.fetch_add(1, Ordering::AcqRel);
            self.pressure.store(false, Ordering::Release);
            Some(Ok(GcReport {
                freed_segments: 1,
                ..GcReport::default()
            }))
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::new()
            .with_min_sleep(Duration::from_millis(10))
            .with_max_sleep(Duration::from_millis(40))
            .with_no_gc_sleep(Duration::from_millis(50))
    }

    #[test]
    fn test_increase_is_capped() {
        let config = fast_config();
        let mut wait = config.min_sleep;
        for _ in 0..10 {
            wait = config.increase(wait);
        }
        assert_eq!(wait, config.max_sleep);
    }

    #[test]
    fn test_start_stop() {
        let target = Arc::new(FakeTarget::default());
        let mut worker = GcWorker::new(Arc::downgrade(&target), fast_config());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.start().unwrap());
        assert!(!worker.start().unwrap());
        assert!(wait_until(|| worker.state() == WorkerState::Idle));
        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_collects_only_under_pressure() {
        let target = Arc::new(FakeTarget::default());
        let mut worker = GcWorker::new(Arc::downgrade(&target), fast_config());
        worker.start().unwrap();

        assert!(wait_until(|| worker.stats().wakeups.load(Ordering::Relaxed) >= 2));
        assert_eq!(target.passes.load(Ordering::Acquire), 0);

        target.pressure.store(true, Ordering::Release);
        worker.wake();
        assert!(wait_until(|| target.passes.load(Ordering::Acquire) == 1));
        assert!(wait_until(|| worker.stats().freed_segments.load(Ordering::Relaxed) == 1));
        worker.stop();
    }

    #[test]
    fn test_frozen_and_paused_skip() {
        let target = Arc::new(FakeTarget::default());
        target.pressure.store(true, Ordering::Release);
        target.frozen.store(true, Ordering::Release);
        let mut worker = GcWorker::new(Arc::downgrade(&target), fast_config());
        worker.start().unwrap();

        assert!(wait_until(|| worker.stats().frozen_skips.load(Ordering::Relaxed) >= 1));
        assert_eq!(target.passes.load(Ordering::Acquire), 0);

        worker.pause();
        target.frozen.store(false, Ordering::Release);
        worker.wake();
        assert!(wait_until(|| worker.state() == WorkerState::Paused));
        assert_eq!(target.passes.load(Ordering::Acquire), 0);

        worker.resume();
        worker.wake();
        assert!(wait_until(|| target.passes.load(Ordering::Acquire) == 1));
        worker.stop();
    }

    #[test]
    fn test_exits_when_target_dropped() {
        let target = Arc::new(FakeTarget::default());
        let mut worker = GcWorker::new(Arc::downgrade(&target), fast_config());
        worker.start().unwrap();
        drop(target);
        worker.wake();
        assert!(wait_until(|| worker.state() == WorkerState::Stopped));
        worker.stop();
    }
}
