//! In-memory storage device
//!
//! Backs a tier with a growable byte vector. Reads past the end return zeros,
//! so a fresh device behaves like a zero-filled disk.

use std::io;

use parking_lot::RwLock;

use crate::device::SyncStorageDevice;

/// Memory-backed disk device
#[derive(Default)]
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
}

impl MemDevice {
    /// Create an empty device
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled device of `size` bytes
    pub fn with_size(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; size as usize]),
        }
    }

    /// Copy of the device contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl SyncStorageDevice for MemDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
        buf[end - start..].fill(0);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_read_write() {
        let disk = MemDevice::new();
        assert_eq!(disk.write_sync(10, &[42u8; 6]).unwrap(), 6);
        assert_eq!(disk.size_sync().unwrap(), 16);

        let mut buf = [1u8; 8];
        assert_eq!(disk.read_sync(8, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0, 0, 42, 42, 42, 42, 42, 42]);
    }

    #[test]
    fn test_mem_device_reads_zero_past_end() {
        let disk = MemDevice::with_size(4);
        let mut buf = [9u8; 8];
        disk.read_sync(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mem_device_truncate() {
        let disk = MemDevice::with_size(1024);
        disk.truncate_sync(512).unwrap();
        assert_eq!(disk.size_sync().unwrap(), 512);
        assert_eq!(disk.contents().len(), 512);
    }
}
