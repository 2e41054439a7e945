//! Reclamation pass state machine

use std::sync::atomic::{AtomicU8, Ordering};

/// Phase of the running reclamation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    /// No pass in progress
    Idle = 0,
    /// Building the top-k victim set from the access counters
    SelectingVictims = 1,
    /// Deciding between skip, delegation and migration for one victim
    PerVictimDecision = 2,
    /// Copying a victim back to the slow tier
    SegmentMigration = 3,
    /// Host collector is reclaiming the victim's slow segment
    DelegatedReclaim = 4,
    /// Removing the victim's mapping and freeing its fast segment
    MappingTeardown = 5,
}

impl GcPhase {
    /// Get the phase as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            GcPhase::Idle => "Idle",
            GcPhase::SelectingVictims => "SelectingVictims",
            GcPhase::PerVictimDecision => "PerVictimDecision",
            GcPhase::SegmentMigration => "SegmentMigration",
            GcPhase::DelegatedReclaim => "DelegatedReclaim",
            GcPhase::MappingTeardown => "MappingTeardown",
        }
    }

    fn can_follow(self, prev: GcPhase) -> bool {
        use GcPhase::*;
        matches!(
            (prev, self),
            (Idle, SelectingVictims)
                | (SelectingVictims, PerVictimDecision)
                | (SelectingVictims, Idle)
                | (PerVictimDecision, SegmentMigration)
                | (PerVictimDecision, DelegatedReclaim)
                | (PerVictimDecision, PerVictimDecision)
                | (PerVictimDecision, Idle)
                | (SegmentMigration, MappingTeardown)
                | (SegmentMigration, PerVictimDecision)
                | (SegmentMigration, Idle)
                | (DelegatedReclaim, MappingTeardown)
                | (DelegatedReclaim, PerVictimDecision)
                | (DelegatedReclaim, Idle)
                | (MappingTeardown, PerVictimDecision)
                | (MappingTeardown, SegmentMigration)
                | (MappingTeardown, Idle)
        )
    }
}

impl From<u8> for GcPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => GcPhase::SelectingVictims,
            2 => GcPhase::PerVictimDecision,
            3 => GcPhase::SegmentMigration,
            4 => GcPhase::DelegatedReclaim,
            5 => GcPhase::MappingTeardown,
            _ => GcPhase::Idle,
        }
    }
}

impl std::fmt::Display for GcPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observable phase of the reclamation engine.
///
/// Passes are serialized by the engine's gate, so only one thread advances
/// the phase at a time; readers may observe it from anywhere.
#[derive(Debug)]
pub struct GcState {
    phase: AtomicU8,
}

impl GcState {
    /// Create a new state in the Idle phase
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(GcPhase::Idle as u8),
        }
    }

    /// Get the current phase
    pub fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Check if a pass is running
    pub fn is_active(&self) -> bool {
        self.phase() != GcPhase::Idle
    }

    /// Move to `next`.
    ///
    /// Returns false and leaves the phase alone if `next` cannot follow the
    /// current phase.
    pub fn advance(&self, next: GcPhase) -> bool {
        let current = self.phase();
        if !next.can_follow(current) {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(from = %current, to = %next, "rejected gc phase transition");
            }
            return false;
        }
        self.phase.store(next as u8, Ordering::Release);
        true
    }

    /// Force the state back to Idle
    pub fn reset(&self) {
        self.phase.store(GcPhase::Idle as u8, Ordering::Release);
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}
