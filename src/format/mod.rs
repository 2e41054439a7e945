//! On-disk format of the fast tier
//!
//! ```text
//! block 0, 1        super-descriptor slots (header + version map + segment map)
//! meta_start..end   mirror of the slow tier's metadata blocks
//! mpt A, mpt B      two copies of the mapping table, `mpt_pages` blocks each
//! counters 0, 1     two copies of the access counters
//! main_blkaddr..    N data segments
//! ```

mod header;
mod layout;

pub use header::{compute_xor_checksum, magic, DescriptorFlags, SuperDescriptor, FORMAT_VERSION};
pub use layout::FormatOptions;
