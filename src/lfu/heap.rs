//! Bounded top-k max-heap over access counts

use crate::lfu::AccessCounters;

/// Halving passes a single selection may trigger before overflowed
/// counters are skipped instead.
const MAX_RESTARTS: u32 = 8;

/// Heap entry: a fast segment and the count it was selected with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapNode {
    /// Access count at selection time
    pub count: i32,
    /// Fast segment offset
    pub segment: u32,
}

/// Max-heap holding at most `k` nodes, root = largest count
#[derive(Debug, Clone)]
pub struct TopKHeap {
    nodes: Vec<HeapNode>,
    k: usize,
}

impl TopKHeap {
    /// Create an empty heap of capacity `k`
    pub fn new(k: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(k),
            k,
        }
    }

    /// Capacity
    pub fn capacity(&self) -> usize {
        self.k
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the heap is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if the heap holds `k` nodes
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    /// Largest node
    pub fn peek(&self) -> Option<&HeapNode> {
        self.nodes.first()
    }

    /// Drop all nodes, keeping capacity
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Nodes in heap order
    pub fn as_slice(&self) -> &[HeapNode] {
        &self.nodes
    }

    /// Append and sift up. Returns false when full.
    pub fn insert(&mut self, node: HeapNode) -> bool {
        if self.is_full() {
            return false;
        }
        self.nodes.push(node);
        let mut i = self.nodes.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.nodes[parent].count >= self.nodes[i].count {
                break;
            }
            self.nodes.swap(parent, i);
            i = parent;
        }
        true
    }

    /// Replace the root and sift down, following the larger child
    pub fn replace_top(&mut self, node: HeapNode) {
        if self.nodes.is_empty() {
            self.insert(node);
            return;
        }
        self.nodes[0] = node;
        let len = self.nodes.len();
        let mut i = 0;
        loop {
            let left = 2 * i + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let larger = if right < len && self.nodes[right].count > self.nodes[left].count {
                right
            } else {
                left
            };
            if self.nodes[i].count >= self.nodes[larger].count {
                break;
            }
            self.nodes.swap(i, larger);
            i = larger;
        }
    }

    /// Offer a candidate: inserted while not full, otherwise it replaces the
    /// root when strictly smaller.
    pub fn offer(&mut self, node: HeapNode) {
        if !self.is_full() {
            self.insert(node);
        } else if self.peek().is_some_and(|top| node.count < top.count) {
            self.replace_top(node);
        }
    }

    /// Nodes ordered least-frequent first, ties by segment
    pub fn into_ascending(self) -> Vec<HeapNode> {
        let mut nodes = self.nodes;
        nodes.sort_unstable_by_key(|n| (n.count, n.segment));
        nodes
    }
}

/// Select the `k` fast segments with the smallest strictly positive counts.
///
/// A negative counter means an increment overflowed: the counters are halved
/// and the scan restarts from the first segment.
pub fn select_victims(counters: &AccessCounters, k: usize) -> TopKHeap {
    let mut heap = TopKHeap::new(k);
    if k == 0 {
        return heap;
    }

    let mut restarts = 0;
    'scan: loop {
        heap.clear();
        for segment in 0..counters.len() {
            let count = counters.get(segment);
            if count < 0 {
                if restarts < MAX_RESTARTS {
                    restarts += 1;
                    counters.halve();
                    continue 'scan;
                }
                tracing::warn!(segment, count, "overflowed counter skipped");
                continue;
            }
            if count > 0 {
                heap.offer(HeapNode { count, segment });
            }
        }
        break;
    }

    if restarts > 0 && tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(restarts, selected = heap.len(), "victim selection restarted");
    }
    heap
}
