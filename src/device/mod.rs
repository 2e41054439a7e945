//! Storage devices for the slow and fast tiers
//!
//! Provides the device trait plus file-backed and in-memory implementations.

mod file_device;
mod mem_device;
mod traits;

pub use file_device::FileSystemFile;
pub use mem_device::MemDevice;
pub use traits::{read_exact_at, write_all_at, SyncStorageDevice, WriteHint};
