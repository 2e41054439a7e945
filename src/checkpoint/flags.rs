//! Selector bits carried in the host's checkpoint record

use std::fmt;

/// Version selector flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct VersionFlags(u32);

impl VersionFlags {
    /// Descriptor slot 1 is authoritative
    pub const SUPER: u32 = 0x1000;
    /// Counter copy 1 is authoritative
    pub const COUNTERS: u32 = 0x10000;

    /// Wrap the host's raw checkpoint flags
    pub const fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Raw value, including bits owned by the host
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Authoritative descriptor slot
    pub const fn super_slot(&self) -> bool {
        self.0 & Self::SUPER != 0
    }

    /// Authoritative counter copy
    pub const fn counter_copy(&self) -> bool {
        self.0 & Self::COUNTERS != 0
    }

    /// Flip the descriptor selector
    pub const fn toggle_super(self) -> Self {
        Self(self.0 ^ Self::SUPER)
    }

    /// Flip the counter selector
    pub const fn toggle_counters(self) -> Self {
        Self(self.0 ^ Self::COUNTERS)
    }
}

impl fmt::Display for VersionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} (super={}, counters={})",
            self.0,
            self.super_slot() as u8,
            self.counter_copy() as u8
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggles_preserve_host_bits() {
        let flags = VersionFlags::new(0x4);
        assert!(!flags.super_slot());
        let t = flags.toggle_super().toggle_counters();
        assert!(t.super_slot() && t.counter_copy());
        assert_eq!(t.value(), 0x4 | 0x1000 | 0x10000);
        assert_eq!(t.toggle_super().toggle_counters(), flags);
    }
}
