// src/core/pipeline/poorest.rs

//! Bounded selection of the N masters with the fewest replicas.

use std::collections::BinaryHeap;

/// Keeps the `n` entries with the smallest count from a stream of
/// `(id, count)` offers.
///
/// Internally a bounded max-heap: admitting an entry is O(1) when it cannot
/// displace the current maximum, O(log n) otherwise. Ties order by ID, so
/// the selection is stable for equal inputs.
#[derive(Debug)]
pub struct PoorestN {
    capacity: usize,
    heap: BinaryHeap<(usize, String)>,
}

impl PoorestN {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    pub fn offer(&mut self, id: &str, count: usize) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push((count, id.to_string()));
            return;
        }
        if let Some(max) = self.heap.peek() {
            if (count, id) < (max.0, max.1.as_str()) {
                self.heap.pop();
                self.heap.push((count, id.to_string()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The selected IDs, poorest first.
    pub fn into_sorted(self) -> Vec<String> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|(_, id)| id)
            .collect()
    }
}
