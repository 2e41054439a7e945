//! Statistics for the fast tier
//!
//! Counters are plain relaxed atomics; snapshots are best-effort.

pub mod metrics;

pub use metrics::{
    CategorySnapshot, GcSnapshot, GcStats, NvmStats, RedirectSnapshot, RedirectStats,
    StatsSnapshot,
};
