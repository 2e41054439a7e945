//! Fast-tier reclamation
//!
//! A pass runs through these phases:
//! - SelectingVictims: the k least-accessed mapped segments are chosen
//! - PerVictimDecision: skip, delegate to the host, or migrate
//! - SegmentMigration / DelegatedReclaim: the segment is emptied
//! - MappingTeardown: the mapping is dropped and the segment freed

mod engine;
mod gc_state;
mod worker;

pub use engine::{GcConfig, GcEngine, GcReport, MigrationLock};
pub(crate) use engine::GcContext;
pub use gc_state::{GcPhase, GcState};
pub use worker::{CollectTarget, GcWorker, WorkerConfig, WorkerSnapshot, WorkerState, WorkerStats};
