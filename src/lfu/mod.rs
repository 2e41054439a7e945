//! Access counting and least-frequently-used victim selection
//!
//! Every redirected I/O bumps the counter of its fast segment. Reclamation
//! picks the `k` segments with the smallest strictly positive counts using a
//! bounded max-heap: the root is the largest of the current candidates, so a
//! smaller count only has to beat the root to get in.

mod counters;
mod heap;

pub use counters::AccessCounters;
pub use heap::{select_victims, HeapNode, TopKHeap};
