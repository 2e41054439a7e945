//! nvmtier - A fast-tier segment cache for a slow block device
//!
//! A small, fast device (NVM) holds whole segments of a large, slow device
//! on behalf of a log-structured host filesystem:
//! - **Mapping**: a bidirectional fast/slow segment table persisted in
//!   alternating page copies
//! - **Redirection**: every host request is resolved to the tier that holds
//!   the authoritative copy of its blocks
//! - **Reclamation**: least-frequently-used segments are migrated back to the
//!   slow tier, or handed to the host's own collector when mostly empty
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nvmtier::prelude::*;
//!
//! NvmTier::format(&*fast, &FormatOptions::new(64, 4096).with_identity(id))?;
//! let tier = NvmTier::mount(fast, slow, host, MountOptions::new(id))?;
//! tier.start_worker()?;
//!
//! let fast_seg = tier.allocate(slow_segment)?;
//! let target = tier.redirect(&IoRequest::read(PageType::Data, block, 8))?;
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod bitmap;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod format;
pub mod gc;
pub mod host;
pub mod lfu;
pub mod mapping;
pub mod redirect;
pub mod stats;
pub mod status;
pub mod tier;
mod utility;

// Re-exports for convenience
pub use address::{Layout, Target, Tier};
pub use status::{NvmError, Result, Status};
pub use tier::{MountOptions, NvmTier};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::{Layout, Target, Tier};
    pub use crate::checkpoint::VersionFlags;
    pub use crate::device::{FileSystemFile, MemDevice, SyncStorageDevice, WriteHint};
    pub use crate::format::FormatOptions;
    pub use crate::gc::{GcConfig, GcPhase, GcReport, WorkerConfig, WorkerState};
    pub use crate::host::{GcMode, HostFilesystem};
    pub use crate::redirect::{IoOp, IoRequest, PageType};
    pub use crate::status::{NvmError, Result, Status};
    pub use crate::tier::{MountOptions, NvmTier};
}
