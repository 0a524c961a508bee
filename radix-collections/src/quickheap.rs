//! Quickheap: a randomized, cache-oblivious priority queue.
//!
//! From "Quickheaps: Simple, Efficient, and Cache-Oblivious" (Navarro and
//! Paredes). The structure is a circular array plus a stack of pivot
//! indices; `peek`/`pop` run *incremental quicksort*, partitioning only as
//! much of the array as needed to expose the current minimum at the
//! starting index. Amortized cost is comparable to a binary heap with far
//! better locality on large queues.
//!
//! # Example
//!
//! ```
//! use radix_collections::QuickHeap;
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! let mut qh = QuickHeap::with_rng(SmallRng::seed_from_u64(7));
//! qh.insert(3u64);
//! qh.insert(1);
//! qh.insert(2);
//!
//! assert_eq!(qh.pop(), Some(1));
//! assert_eq!(qh.pop(), Some(2));
//! assert_eq!(qh.pop(), Some(3));
//! assert_eq!(qh.pop(), None);
//! ```

use std::cmp::Ordering;
use std::fmt;

use rand_core::RngCore;

use crate::stack::PivotStack;

/// Default capacity; doubles on demand.
const INITIAL_CAPACITY: usize = 2048;

/// A min-ordered quickheap.
///
/// Storage is circular with a power-of-two capacity, so positions are
/// signed and reduced by masking; the stack's bottom entry records one
/// past the last occupied slot.
pub struct QuickHeap<T, R> {
    heap: Box<[Option<T>]>,
    capacity: i32,
    /// Starting index; advanced by `pop`.
    idx: i32,
    stack: PivotStack,
    rng: R,
}

impl<T: Ord, R: RngCore> QuickHeap<T, R> {
    /// Creates an empty quickheap with the default capacity.
    pub fn with_rng(rng: R) -> Self {
        Self::with_capacity_and_rng(INITIAL_CAPACITY, rng)
    }

    /// Creates an empty quickheap with at least `capacity` slots
    /// (rounded up to a power of two).
    pub fn with_capacity_and_rng(capacity: usize, rng: R) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let mut heap = Vec::with_capacity(capacity);
        heap.resize_with(capacity, || None);

        let mut stack = PivotStack::new();
        stack.push(0);

        Self {
            heap: heap.into_boxed_slice(),
            capacity: capacity as i32,
            idx: 0,
            stack,
            rng,
        }
    }

    /// Returns the number of queued elements.
    #[inline]
    pub fn len(&self) -> usize {
        (self.stack.item(0) - self.idx) as usize
    }

    /// Returns `true` if the heap is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the minimum element.
    ///
    /// Takes `&mut self`: exposing the minimum partitions the array.
    pub fn peek(&mut self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.incremental_sort();
        Some(self.element(self.idx))
    }

    /// Removes and returns the minimum element.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.incremental_sort();

        let min = self.take_at(self.idx);
        self.idx += 1;
        self.stack.pop(1);
        if self.reduce(self.idx) == 0 {
            self.reduce_indices();
        }
        min
    }

    /// Inserts an element, growing the array if it is full.
    ///
    /// The walk starts at the fictitious pivot and shifts each pivot one
    /// slot right; the vacancy left behind either receives the new
    /// element (when the next pivot no longer precedes it) or the bottom
    /// element of the bucket below, descending a level.
    pub fn insert(&mut self, value: T) {
        if self.len() == self.capacity as usize {
            self.expand();
        }

        let mut pidx = 0;
        loop {
            let pivot = self.stack.item(pidx);
            // The fictitious pivot's slot is vacant; real pivots shift into
            // the vacancy left by the previous level.
            let shifted = self.take_at(pivot);
            if shifted.is_some() {
                self.put_at(pivot + 1, shifted);
            }
            self.stack.set(pidx, pivot + 1);

            if pidx + 1 == self.stack.depth()
                || *self.element(self.stack.item(pidx + 1)) <= value
            {
                break;
            }

            // Bottom element of the bucket below fills the vacancy; a None
            // here means that bucket is empty and the vacancy just moves.
            let below = self.take_at(self.stack.item(pidx + 1) + 1);
            if below.is_some() {
                self.put_at(pivot, below);
            }
            pidx += 1;
        }

        self.put_at(self.stack.item(pidx) - 1, Some(value));
    }

    /// Partitions just enough of the array that the element at `idx` is
    /// the minimum, i.e. until the top pivot equals the starting index.
    fn incremental_sort(&mut self) {
        while self.idx != self.stack.top() {
            let span = (self.stack.top() - self.idx) as u32;
            let pivot_at = self.idx + (self.rng.next_u32() % span) as i32;
            let split = self.partition(pivot_at, self.idx, self.stack.top() - 1);
            self.stack.push(split);
        }
    }

    /// Hoare partition of `[low, high]` around the element at `pivot_at`,
    /// returning the split point.
    ///
    /// The pivot is moved to `low` first and tracked through swaps, then
    /// landed on the split point: later rounds treat stack entries as the
    /// positions of their pivot elements, so the split and the pivot must
    /// coincide.
    fn partition(&mut self, pivot_at: i32, low: i32, high: i32) -> i32 {
        if !self.equivalent(pivot_at, low) {
            self.swap_slots(pivot_at, low);
        }
        let mut pivot_pos = low;

        let mut l = low - 1;
        let mut h = high + 1;
        loop {
            loop {
                h -= 1;
                if self.cmp_slots(h, pivot_pos) != Ordering::Greater {
                    break;
                }
            }
            loop {
                l += 1;
                if self.cmp_slots(l, pivot_pos) != Ordering::Less {
                    break;
                }
            }
            if l >= h {
                break;
            }
            self.swap_slots(l, h);
            if self.equivalent(l, pivot_pos) {
                pivot_pos = h;
            } else if self.equivalent(h, pivot_pos) {
                pivot_pos = l;
            }
        }

        if pivot_pos < h {
            self.swap_slots(pivot_pos, h);
        } else if pivot_pos > h {
            h += 1;
            self.swap_slots(pivot_pos, h);
        }
        h
    }

    /// Doubles the array. The live region is circular, so the wrapped
    /// prefix `[0, idx)` is re-homed into the new upper half to keep it
    /// contiguous, after index normalisation.
    fn expand(&mut self) {
        let old_capacity = self.capacity;

        let old = std::mem::take(&mut self.heap);
        let mut heap = old.into_vec();
        heap.resize_with(old_capacity as usize * 2, || None);
        self.heap = heap.into_boxed_slice();
        self.capacity = old_capacity * 2;

        self.reduce_indices();
        for i in 0..self.idx {
            let moved = self.heap[i as usize].take();
            self.put_at(i + old_capacity, moved);
        }
    }

    /// Rewrites the stack entries as offsets from the reduced starting
    /// index, then reduces the starting index itself.
    fn reduce_indices(&mut self) {
        let reduced_idx = self.reduce(self.idx) as i32;
        for i in 0..self.stack.depth() {
            self.stack.set(i, reduced_idx + self.stack.item(i) - self.idx);
        }
        self.idx = reduced_idx;
    }

    #[inline]
    fn reduce(&self, at: i32) -> usize {
        (at & (self.capacity - 1)) as usize
    }

    #[inline]
    fn equivalent(&self, a: i32, b: i32) -> bool {
        self.reduce(a - b) == 0
    }

    #[inline]
    fn element(&self, at: i32) -> &T {
        self.heap[self.reduce(at)].as_ref().expect("occupied slot")
    }

    #[inline]
    fn cmp_slots(&self, a: i32, b: i32) -> Ordering {
        self.element(a).cmp(self.element(b))
    }

    #[inline]
    fn take_at(&mut self, at: i32) -> Option<T> {
        let r = self.reduce(at);
        self.heap[r].take()
    }

    #[inline]
    fn put_at(&mut self, at: i32, value: Option<T>) {
        let r = self.reduce(at);
        self.heap[r] = value;
    }

    #[inline]
    fn swap_slots(&mut self, a: i32, b: i32) {
        let (ra, rb) = (self.reduce(a), self.reduce(b));
        self.heap.swap(ra, rb);
    }
}

impl<T, R> fmt::Debug for QuickHeap<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuickHeap")
            .field("len", &(self.stack.item(0) - self.idx))
            .field("capacity", &self.capacity)
            .field("idx", &self.idx)
            .field("pivots", &self.stack.depth())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn make(seed: u64) -> QuickHeap<u64, SmallRng> {
        QuickHeap::with_capacity_and_rng(16, SmallRng::seed_from_u64(seed))
    }

    #[test]
    fn empty_heap() {
        let mut qh = make(1);
        assert!(qh.is_empty());
        assert_eq!(qh.peek(), None);
        assert_eq!(qh.pop(), None);
    }

    #[test]
    fn single_element() {
        let mut qh = make(2);
        qh.insert(42);
        assert_eq!(qh.len(), 1);
        assert_eq!(qh.peek(), Some(&42));
        assert_eq!(qh.pop(), Some(42));
        assert!(qh.is_empty());
    }

    #[test]
    fn shuffled_inserts_pop_sorted() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut values: Vec<u64> = (0..20).collect();
        values.shuffle(&mut rng);

        let mut qh = QuickHeap::with_capacity_and_rng(32, SmallRng::seed_from_u64(4));
        for v in values {
            qh.insert(v);
        }

        for expected in 0..20 {
            assert_eq!(qh.pop(), Some(expected));
        }
        assert_eq!(qh.pop(), None);
    }

    #[test]
    fn duplicates() {
        let mut qh = make(5);
        for _ in 0..5 {
            qh.insert(9);
        }
        qh.insert(1);
        assert_eq!(qh.pop(), Some(1));
        for _ in 0..5 {
            assert_eq!(qh.pop(), Some(9));
        }
        assert!(qh.is_empty());
    }

    #[test]
    fn peek_is_stable() {
        let mut qh = make(6);
        qh.insert(5);
        qh.insert(3);
        qh.insert(7);
        assert_eq!(qh.peek(), Some(&3));
        assert_eq!(qh.peek(), Some(&3));
        assert_eq!(qh.len(), 3);
    }

    #[test]
    fn interleaved_insert_pop() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut qh = QuickHeap::with_capacity_and_rng(64, SmallRng::seed_from_u64(8));
        let mut reference = std::collections::BinaryHeap::new();

        for _ in 0..2000 {
            if reference.is_empty() || rng.gen_ratio(2, 3) {
                let v = rng.gen_range(0u64..1000);
                qh.insert(v);
                reference.push(std::cmp::Reverse(v));
            } else {
                let expected = reference.pop().map(|r| r.0);
                assert_eq!(qh.pop(), expected);
            }
            assert_eq!(qh.len(), reference.len());
        }
    }

    #[test]
    fn expansion_with_nonzero_idx() {
        let mut rng = SmallRng::seed_from_u64(9);
        let mut qh = QuickHeap::with_capacity_and_rng(16, SmallRng::seed_from_u64(10));
        let mut reference = std::collections::BinaryHeap::new();

        for _ in 0..16 {
            let v = rng.gen_range(0u64..65536);
            qh.insert(v);
            reference.push(std::cmp::Reverse(v));
        }

        // Advance idx, then force growth so the wrapped prefix is re-homed.
        for _ in 0..8 {
            assert_eq!(qh.pop(), reference.pop().map(|r| r.0));
        }
        for _ in 0..24 {
            let v = rng.gen_range(0u64..65536);
            qh.insert(v);
            reference.push(std::cmp::Reverse(v));
        }

        while let Some(std::cmp::Reverse(expected)) = reference.pop() {
            assert_eq!(qh.pop(), Some(expected));
        }
        assert!(qh.is_empty());
    }

    #[test]
    fn pop_order_matches_binary_heap_large() {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut qh = QuickHeap::with_rng(SmallRng::seed_from_u64(12));
        let mut reference = std::collections::BinaryHeap::new();

        for _ in 0..4096 {
            let v = rng.gen_range(0u64..65536);
            qh.insert(v);
            reference.push(std::cmp::Reverse(v));
        }

        while let Some(std::cmp::Reverse(expected)) = reference.pop() {
            assert_eq!(qh.pop(), Some(expected));
        }
    }
}
