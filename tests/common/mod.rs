//! Shared test utilities for fault injection and tier setup.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use nvmtier::device::{MemDevice, SyncStorageDevice, WriteHint};
use nvmtier::format::FormatOptions;
use nvmtier::host::{GcMode, HostFilesystem};
use nvmtier::{MountOptions, NvmTier, Result};

pub const IDENTITY: Uuid = Uuid::from_u128(0x6e76_6d74_6965_72);
pub const BLOCK_SIZE: u32 = 4096;
pub const BLOCKS_PER_SEGMENT: u32 = 8;
pub const SLOW_SEGMENTS: u32 = 16;
pub const SLOW_MAIN_BLKADDR: u64 = 64;

/// A fault-injection wrapper around any `SyncStorageDevice`.
///
/// Allows deterministic injection of:
/// - write errors at a specific operation count
/// - flush errors on demand
/// - partial (truncated) writes
/// - a callback after a chosen write lands
pub struct FaultInjectionDevice<D> {
    inner: D,
    /// Total number of writes observed so far.
    write_count: AtomicU64,
    /// Writes that carried the warm placement hint.
    warm_writes: AtomicU64,
    /// When non-zero, the Nth write (1-based) will return an I/O error.
    fail_write_at: AtomicU64,
    /// When true, the next flush_sync call will return an error.
    fail_next_flush: AtomicBool,
    /// When non-zero, the next write will be silently truncated to at most
    /// this many bytes (simulating a partial / torn write).
    partial_write_max: AtomicUsize,
    /// Runs once, right after the given write (1-based) succeeds.
    after_write: Mutex<Option<(u64, WriteHook)>>,
}

type WriteHook = Box<dyn FnOnce() + Send>;

impl<D: SyncStorageDevice> FaultInjectionDevice<D> {
    /// Wrap an existing device for fault injection.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            write_count: AtomicU64::new(0),
            warm_writes: AtomicU64::new(0),
            fail_write_at: AtomicU64::new(0),
            fail_next_flush: AtomicBool::new(false),
            partial_write_max: AtomicUsize::new(0),
            after_write: Mutex::new(None),
        }
    }

    /// Make the Nth write (1-based) return `io::ErrorKind::Other`.
    pub fn inject_write_error_at(&self, operation_n: u64) {
        self.fail_write_at.store(operation_n, Ordering::SeqCst);
    }

    /// Make the `ahead`-th write from now fail (1 = the very next write).
    pub fn inject_write_error_after(&self, ahead: u64) {
        self.inject_write_error_at(self.write_count() + ahead);
    }

    /// Make the next `flush_sync` call return an error.
    pub fn inject_flush_error(&self) {
        self.fail_next_flush.store(true, Ordering::SeqCst);
    }

    /// Make the next write silently truncate data to at most `max_bytes`.
    pub fn inject_partial_write(&self, max_bytes: usize) {
        self.partial_write_max.store(max_bytes, Ordering::SeqCst);
    }

    /// Run `hook` right after the `ahead`-th write from now lands.
    pub fn run_after_write(&self, ahead: u64, hook: impl FnOnce() + Send + 'static) {
        *self.after_write.lock() = Some((self.write_count() + ahead, Box::new(hook)));
    }

    /// Return the total number of writes observed.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Return the number of writes hinted warm.
    pub fn warm_writes(&self) -> u64 {
        self.warm_writes.load(Ordering::SeqCst)
    }

    /// Borrow the wrapped device.
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: SyncStorageDevice> SyncStorageDevice for FaultInjectionDevice<D> {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;

        let target = self.fail_write_at.load(Ordering::SeqCst);
        if target != 0 && n == target {
            return Err(io::Error::other(format!(
                "injected write error at operation {n}"
            )));
        }

        let max = self.partial_write_max.swap(0, Ordering::SeqCst);
        let result = if max > 0 && max < buf.len() {
            self.inner.write_sync(offset, &buf[..max])
        } else {
            self.inner.write_sync(offset, buf)
        };

        if result.is_ok() {
            let hook = {
                let mut slot = self.after_write.lock();
                match slot.as_ref() {
                    Some((at, _)) if *at == n => slot.take().map(|(_, hook)| hook),
                    _ => None,
                }
            };
            if let Some(hook) = hook {
                hook();
            }
        }
        result
    }

    fn write_hinted(&self, offset: u64, buf: &[u8], hint: WriteHint) -> io::Result<usize> {
        if hint == WriteHint::Warm {
            self.warm_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        if self.fail_next_flush.swap(false, Ordering::SeqCst) {
            return Err(io::Error::other("injected flush error"));
        }
        self.inner.flush_sync()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.inner.truncate_sync(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.inner.size_sync()
    }

    fn alignment(&self) -> usize {
        self.inner.alignment()
    }

    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }
}

/// Host filesystem double with scriptable answers.
#[derive(Default)]
pub struct MockHost {
    pub valid: Mutex<HashMap<u32, u32>>,
    pub busy: Mutex<Vec<u32>>,
    pub reclaimed: Mutex<Vec<(u32, GcMode)>>,
    pub default_valid: AtomicU32,
    pub prefree: AtomicU32,
    pub checkpoints: AtomicU32,
    pub frozen: AtomicBool,
}

impl MockHost {
    /// Host where every slow segment is completely live.
    pub fn full() -> Self {
        let host = Self::default();
        host.default_valid
            .store(BLOCKS_PER_SEGMENT, Ordering::SeqCst);
        host
    }

    pub fn set_valid(&self, slow: u32, blocks: u32) {
        self.valid.lock().insert(slow, blocks);
    }

    pub fn set_busy(&self, slow: u32) {
        self.busy.lock().push(slow);
    }

    pub fn reclaimed(&self) -> Vec<u32> {
        self.reclaimed.lock().iter().map(|(slow, _)| *slow).collect()
    }
}

impl HostFilesystem for MockHost {
    fn is_segment_busy(&self, slow: u32) -> bool {
        self.busy.lock().contains(&slow)
    }

    fn valid_blocks(&self, slow: u32) -> u32 {
        self.valid
            .lock()
            .get(&slow)
            .copied()
            .unwrap_or_else(|| self.default_valid.load(Ordering::SeqCst))
    }

    fn reclaim_segment(&self, slow: u32, mode: GcMode) -> Result<u32> {
        self.reclaimed.lock().push((slow, mode));
        Ok(1)
    }

    fn prefree_segments(&self) -> u32 {
        self.prefree.load(Ordering::SeqCst)
    }

    fn write_checkpoint(&self) -> Result<()> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        self.prefree.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}

pub type SlowDevice = FaultInjectionDevice<MemDevice>;

/// Small geometry: 8-block segments, metadata mirror at blocks 2..8.
pub fn format_options(fast_segments: u32) -> FormatOptions {
    FormatOptions::new(fast_segments, SLOW_SEGMENTS)
        .with_block_size(BLOCK_SIZE)
        .with_blocks_per_segment(BLOCKS_PER_SEGMENT)
        .with_slow_main_blkaddr(SLOW_MAIN_BLKADDR)
        .with_meta_range(2, 8)
        .with_identity(IDENTITY)
}

/// A formatted and mounted tier with handles on every collaborator.
pub struct Harness {
    pub fast: Arc<MemDevice>,
    pub slow: Arc<SlowDevice>,
    pub host: Arc<MockHost>,
    pub tier: NvmTier,
}

impl Harness {
    pub fn new(fast_segments: u32) -> Self {
        Self::with_options(fast_segments, MountOptions::new(IDENTITY))
    }

    pub fn with_options(fast_segments: u32, options: MountOptions) -> Self {
        let fast = Arc::new(MemDevice::new());
        NvmTier::format(&*fast, &format_options(fast_segments)).unwrap();
        let slow_bytes = (SLOW_MAIN_BLKADDR + (SLOW_SEGMENTS * BLOCKS_PER_SEGMENT) as u64)
            * BLOCK_SIZE as u64;
        let slow = Arc::new(FaultInjectionDevice::new(MemDevice::with_size(slow_bytes)));
        let host = Arc::new(MockHost::full());
        let tier = NvmTier::mount(fast.clone(), slow.clone(), host.clone(), options).unwrap();
        Self {
            fast,
            slow,
            host,
            tier,
        }
    }

    /// Fill fast segment `fast` with `byte`.
    pub fn fill_fast(&self, fast: u32, byte: u8) {
        let layout = self.tier.layout();
        let bytes = vec![byte; layout.segment_bytes() as usize];
        let offset = layout.byte_offset(layout.fast_segment_start(fast));
        self.fast.write_sync(offset, &bytes).unwrap();
    }

    /// Read slow segment `slow` back.
    pub fn slow_segment(&self, slow: u32) -> Vec<u8> {
        let layout = self.tier.layout();
        let mut bytes = vec![0u8; layout.segment_bytes() as usize];
        let offset = layout.byte_offset(layout.slow_segment_start(slow));
        self.slow.read_sync(offset, &mut bytes).unwrap();
        bytes
    }

    /// First slow-tier block of slow segment `slow`.
    pub fn slow_block(&self, slow: u32) -> u64 {
        self.tier.layout().slow_segment_start(slow)
    }
}

/// Flip one bit at the given byte offset in a file.
pub fn corrupt_byte_at(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8];
    file.read_exact(&mut byte)?;
    byte[0] ^= 0x01; // flip lowest bit
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}
