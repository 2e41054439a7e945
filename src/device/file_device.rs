//! File-backed storage device
//!
//! Either tier can live in a regular file or a block device node.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

/// File system file wrapper
///
/// Wraps a file with mutex protection for thread-safe access.
pub struct FileSystemFile {
    /// Path to the file
    path: PathBuf,
    /// The underlying file
    file: Mutex<File>,
}

impl FileSystemFile {
    /// Open or create a file at the specified path
    pub fn open(path: impl AsRef<Path>, create: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Create a file of exactly `size` bytes, zero-filled
    pub fn create_with_size(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let dev = Self::open(path, true)?;
        dev.file.lock().set_len(size)?;
        Ok(dev)
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileSystemFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        // Regular files may return short reads; keep going until EOF.
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.file.lock().set_len(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }
}
