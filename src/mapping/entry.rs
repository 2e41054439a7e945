//! Mapping entry record and its packed on-disk form

use std::fmt;

/// Read/write redirect bits of a mapping entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RedirectFlags {
    /// Reads of the slow segment go to the fast tier
    pub read: bool,
    /// Writes to the slow segment go to the fast tier
    pub write: bool,
}

impl RedirectFlags {
    /// No mapping
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };
    /// Fully redirected
    pub const FULL: Self = Self {
        read: true,
        write: true,
    };
    /// Migration in flight: reads still served from the fast tier, writers wait
    pub const MIGRATING: Self = Self {
        read: true,
        write: false,
    };

    /// Packed two-bit form (`write << 1 | read`)
    #[inline]
    pub const fn bits(self) -> u32 {
        (self.write as u32) << 1 | self.read as u32
    }

    /// Decode from the low two bits
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & 0b01 != 0,
            write: bits & 0b10 != 0,
        }
    }

    /// Check whether any redirect bit is set
    #[inline]
    pub const fn any(self) -> bool {
        self.read || self.write
    }
}

impl fmt::Display for RedirectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.read { 'r' } else { '-' };
        let w = if self.write { 'w' } else { '-' };
        write!(f, "{r}{w}")
    }
}

/// One mapping table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappingEntry {
    /// Segment offset on the other tier
    pub target: u32,
    /// Redirect bits
    pub flags: RedirectFlags,
}

impl MappingEntry {
    /// Unmapped entry
    pub const EMPTY: Self = Self {
        target: 0,
        flags: RedirectFlags::NONE,
    };

    /// Largest target that survives packing
    pub const MAX_TARGET: u32 = u32::MAX >> 2;

    /// Create an entry
    pub const fn new(target: u32, flags: RedirectFlags) -> Self {
        Self { target, flags }
    }

    /// Check whether the entry holds a mapping
    #[inline]
    pub const fn is_mapped(&self) -> bool {
        self.flags.any()
    }

    /// Check whether the entry is mid-migration
    #[inline]
    pub const fn is_migrating(&self) -> bool {
        self.flags.read && !self.flags.write
    }

    /// On-disk word: `(target << 2) | flags`
    #[inline]
    pub const fn pack(&self) -> u32 {
        (self.target << 2) | self.flags.bits()
    }

    /// Decode an on-disk word
    #[inline]
    pub const fn unpack(raw: u32) -> Self {
        Self {
            target: raw >> 2,
            flags: RedirectFlags::from_bits(raw),
        }
    }
}
