//! Storage device traits for the two tiers
//!
//! Both the slow tier and the fast tier are driven through
//! [`SyncStorageDevice`]; every call is synchronous and byte-addressed.

use std::io;

/// Placement hint passed with a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteHint {
    /// No hint
    #[default]
    None,
    /// Data moved back from the fast tier; expected to be read again soon
    Warm,
}

impl WriteHint {
    /// Get the hint name
    pub const fn as_str(&self) -> &'static str {
        match self {
            WriteHint::None => "none",
            WriteHint::Warm => "warm",
        }
    }
}

/// Synchronous storage device trait
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read data synchronously
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data synchronously
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Write data with a placement hint.
    ///
    /// Devices without placement control ignore the hint.
    fn write_hinted(&self, offset: u64, buf: &[u8], _hint: WriteHint) -> io::Result<usize> {
        self.write_sync(offset, buf)
    }

    /// Flush synchronously
    fn flush_sync(&self) -> io::Result<()>;

    /// Truncate synchronously
    fn truncate_sync(&self, size: u64) -> io::Result<()>;

    /// Get the current size
    fn size_sync(&self) -> io::Result<u64>;

    /// Get alignment requirement
    fn alignment(&self) -> usize {
        512
    }

    /// Get sector size
    fn sector_size(&self) -> usize {
        512
    }
}

/// Read exactly `buf.len()` bytes at `offset`.
///
/// A short read is reported as `UnexpectedEof`.
pub fn read_exact_at(
    device: &dyn SyncStorageDevice,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    let n = device.read_sync(offset, buf)?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {offset}: {n} of {} bytes", buf.len()),
        ));
    }
    Ok(())
}

/// Write all of `buf` at `offset` with `hint`.
///
/// A short write is reported as `WriteZero`.
pub fn write_all_at(
    device: &dyn SyncStorageDevice,
    offset: u64,
    buf: &[u8],
    hint: WriteHint,
) -> io::Result<()> {
    let n = device.write_hinted(offset, buf, hint)?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write at {offset}: {n} of {} bytes", buf.len()),
        ));
    }
    Ok(())
}
