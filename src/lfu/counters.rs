//! Per-segment access counters

use std::sync::atomic::{AtomicI32, Ordering};

use crate::status::{NvmError, Result};

/// Halved value of a counter; negative (overflowed) counters restart high
#[inline]
fn halved(v: i32) -> i32 {
    if v < 0 {
        i32::MAX >> 1
    } else {
        ((v as i64 + 1) >> 1) as i32
    }
}

/// One signed 32-bit counter per fast segment
pub struct AccessCounters {
    counts: Box<[AtomicI32]>,
}

impl AccessCounters {
    /// Create `len` zeroed counters
    pub fn new(len: u32) -> Self {
        Self {
            counts: (0..len).map(|_| AtomicI32::new(0)).collect(),
        }
    }

    /// Create counters holding `values`
    pub fn from_values(values: &[i32]) -> Self {
        Self {
            counts: values.iter().map(|&v| AtomicI32::new(v)).collect(),
        }
    }

    /// Number of counters
    pub fn len(&self) -> u32 {
        self.counts.len() as u32
    }

    /// Check if there are no counters
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Current value of counter `fast`
    #[inline]
    pub fn get(&self, fast: u32) -> i32 {
        self.counts[fast as usize].load(Ordering::Relaxed)
    }

    /// Count one access to `fast`, returning the new value.
    ///
    /// An increment that would overflow halves every counter first.
    pub fn record_access(&self, fast: u32) -> i32 {
        let counter = &self.counts[fast as usize];
        loop {
            let cur = counter.load(Ordering::Relaxed);
            if cur < 0 || cur == i32::MAX {
                self.halve();
                continue;
            }
            if counter
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return cur + 1;
            }
        }
    }

    /// Halve every counter.
    ///
    /// Each counter is updated atomically, but the pass as a whole is not:
    /// concurrent increments may land before or after their counter is halved.
    pub fn halve(&self) {
        for counter in self.counts.iter() {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| Some(halved(v)));
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(counters = self.counts.len(), "access counters halved");
        }
    }

    /// Zero counter `fast`
    pub fn reset(&self, fast: u32) {
        self.counts[fast as usize].store(0, Ordering::Release);
    }

    /// Copy of all counter values
    pub fn snapshot(&self) -> Vec<i32> {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Bytes needed to persist the counters
    pub fn encoded_len(&self) -> usize {
        self.counts.len() * 4
    }

    /// Little-endian encoding, zero-padded to `padded_len`
    pub fn encode(&self, padded_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(padded_len.max(self.encoded_len()));
        for v in self.snapshot() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        if out.len() < padded_len {
            out.resize(padded_len, 0);
        }
        out
    }

    /// Overwrite every counter from its encoding
    pub fn load(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < self.encoded_len() {
            return Err(NvmError::Corruption(format!(
                "counter region too short: {} of {} bytes",
                bytes.len(),
                self.encoded_len()
            )));
        }
        for (counter, chunk) in self.counts.iter().zip(bytes.chunks_exact(4)) {
            let mut word = [0u8; 4];
            word.copy_from_slice(chunk);
            counter.store(i32::from_le_bytes(word), Ordering::Release);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AccessCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
