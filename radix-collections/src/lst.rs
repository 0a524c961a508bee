//! Leftmost skeleton tree: a randomized priority queue with O(1)
//! amortised pop and arbitrary deletion.
//!
//! From "Stronger Quickheaps" (Navarro, Paredes, Poblete, Sanders). An LST
//! is either a *bucket* (a multiset) or a triple `(root, left, bucket)`
//! where everything in `left` precedes the root and everything in the
//! bucket follows it. Flattened onto a circular array, that is a sequence
//! of unordered buckets separated by pivots in ascending order, plus a
//! stack of pivot indices whose permanent bottom entry (the *fictitious
//! pivot*) records one past the last occupied slot.
//!
//! Popping the minimum empties the leftmost bucket, so the starting index
//! just advances (the quickheap's trick), while insertion walks the
//! pivots from the outside in, occasionally flattening a subtree at random
//! to keep the expected shape balanced.
//!
//! Elements live in a slab; [`insert`](Lst::insert) returns a stable
//! [`Key`] that names the element for [`extract`](Lst::extract) no matter
//! how far it has migrated through the array since.
//!
//! # Example
//!
//! ```
//! use radix_collections::Lst;
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! let mut lst = Lst::with_rng(SmallRng::seed_from_u64(1));
//! let a = lst.insert(30u64);
//! lst.insert(10);
//! lst.insert(20);
//!
//! assert_eq!(lst.extract(Some(a)), Some(30));
//! assert_eq!(lst.pop(), Some(10));
//! assert_eq!(lst.pop(), Some(20));
//! assert_eq!(lst.pop(), None);
//! ```

use std::cmp::Ordering;
use std::fmt;

use rand_core::RngCore;
use slab::Slab;

use crate::stack::PivotStack;

/// Default capacity; doubles on demand.
const INITIAL_CAPACITY: usize = 2048;

/// Marker for array slots outside the live region.
const VACANT: usize = usize::MAX;

/// Stable handle to an element queued in an [`Lst`].
///
/// Remains valid until the element is popped or extracted; using a stale
/// key is detected and reported as a failed extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(usize);

struct Node<T> {
    data: T,
    /// Reduced position of this element in the circular array.
    pos: i32,
}

/// A min-ordered leftmost skeleton tree.
pub struct Lst<T, R> {
    /// Circular array of slab keys; `capacity` is a power of two.
    heap: Box<[usize]>,
    capacity: i32,
    /// Starting index: the first element of the leftmost bucket.
    idx: i32,
    len: i32,
    stack: PivotStack,
    slab: Slab<Node<T>>,
    rng: R,
}

impl<T: Ord, R: RngCore> Lst<T, R> {
    /// Creates an empty LST with the default capacity.
    pub fn with_rng(rng: R) -> Self {
        Self::with_capacity_and_rng(INITIAL_CAPACITY, rng)
    }

    /// Creates an empty LST with at least `capacity` slots (rounded up to
    /// a power of two).
    pub fn with_capacity_and_rng(capacity: usize, rng: R) -> Self {
        let capacity = capacity.next_power_of_two().max(2);

        let mut stack = PivotStack::new();
        stack.push(0);

        Self {
            heap: vec![VACANT; capacity].into_boxed_slice(),
            capacity: capacity as i32,
            idx: 0,
            len: 0,
            stack,
            slab: Slab::with_capacity(capacity),
            rng,
        }
    }

    /// Returns the number of queued elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` if the tree is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `key` names a live element.
    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        self.slab.contains(key.0)
    }

    /// Returns a reference to the element named by `key`.
    #[inline]
    pub fn get(&self, key: Key) -> Option<&T> {
        self.slab.get(key.0).map(|node| &node.data)
    }

    /// Inserts an element, returning its stable key.
    ///
    /// Descends from the whole tree: at each level the subtree is
    /// flattened with probability `1 / (size + 1)` (never at level 0, so
    /// the fictitious pivot survives), otherwise the walk stops at the
    /// rightmost bucket consistent with the pivots.
    pub fn insert(&mut self, value: T) -> Key {
        if self.len == self.capacity {
            self.expand();
        }

        let key = self.slab.insert(Node { data: value, pos: -1 });

        let mut si = 0;
        while !self.is_bucket(si) {
            if si != 0 {
                let bound = self.size(si) as u32 + 1;
                if self.rng.next_u32() % bound == 0 {
                    // The dissolved pivot's stack entry stays readable for
                    // bucket_add below.
                    self.flatten(si);
                    break;
                }
            }
            let inner_pivot = self.key_at(self.stack.item(si + 1));
            if self.slab[key].data >= self.slab[inner_pivot].data {
                break;
            }
            si += 1;
        }

        self.bucket_add(si, key);
        Key(key)
    }

    /// Returns a reference to the minimum element.
    ///
    /// Takes `&mut self`: locating the minimum partitions buckets.
    pub fn peek(&mut self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let si = self.find_empty_left();
        let key = self.key_at(self.stack.item(si));
        Some(&self.slab[key].data)
    }

    /// Removes and returns the minimum element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        let si = self.find_empty_left();
        let key = self.key_at(self.stack.item(si));

        // The minimum is the pivot bounding an empty left subtree and sits
        // at the starting index, so the flatten plus the bucket_delete
        // fast path make this O(1) beyond the partitioning already done.
        self.flatten(si);
        Some(self.bucket_delete(key))
    }

    /// Removes the element named by `key`, or pops and discards the
    /// minimum when `key` is `None`.
    ///
    /// Returns `None` if the tree is empty or the key is stale.
    // TODO: level_of runs again inside bucket_delete; hoist the scan.
    pub fn extract(&mut self, key: Option<Key>) -> Option<T> {
        let Some(Key(key)) = key else {
            return self.pop();
        };

        if self.len == 0 || !self.slab.contains(key) {
            return None;
        }

        let loc_off = self.offset(self.slab[key].pos);
        let si = self.level_of(loc_off);

        // Deleting a pivot outright would orphan its stack entry; dissolve
        // it into the enclosing bucket first.
        if si > 0 && self.stack_offset(si) == loc_off {
            self.flatten(si);
        }

        Some(self.bucket_delete(key))
    }

    // ========================================================================
    // Subtree arithmetic
    // ========================================================================

    /// Number of buckets in subtree `si`.
    #[inline]
    fn length(&self, si: usize) -> usize {
        self.stack.depth() - si
    }

    /// A subtree is a pure bucket when it spans a single bucket.
    #[inline]
    fn is_bucket(&self, si: usize) -> bool {
        self.length(si) == 1
    }

    /// Number of elements in subtree `si`: the circular distance from the
    /// starting index to the subtree's bounding pivot.
    fn size(&self, si: usize) -> i32 {
        if si == 0 {
            return self.len;
        }

        let reduced_right = self.reduce(self.stack.item(si)) as i32;
        let reduced_idx = self.reduce(self.idx) as i32;

        if reduced_idx <= reduced_right {
            reduced_right - reduced_idx
        } else {
            self.capacity - reduced_idx + reduced_right
        }
    }

    /// Dissolves pivot `si` and everything above it into the enclosing
    /// bucket. O(1): only the stack depth changes.
    #[inline]
    fn flatten(&mut self, si: usize) {
        self.stack.pop(self.stack.depth() - si);
    }

    /// Lower bound of bucket `si`; may exceed the upper bound by one when
    /// the bucket is empty.
    #[inline]
    fn bucket_lwb(&self, si: usize) -> i32 {
        if self.is_bucket(si) {
            self.idx
        } else {
            self.stack.item(si + 1) + 1
        }
    }

    #[inline]
    fn bucket_upb(&self, si: usize) -> i32 {
        self.stack.item(si) - 1
    }

    // ========================================================================
    // Core operations
    // ========================================================================

    /// Adds `key` to the bucket of subtree `si`.
    ///
    /// For each bucket to the right, starting from the top: open a space
    /// at its upper end, move its bottom element there (order within a
    /// bucket does not matter, so one move suffices), and shift its
    /// bounding pivot up. The space finally opened at this level's old
    /// pivot position receives the new element.
    fn bucket_add(&mut self, si: usize, key: usize) {
        for r in 0..si {
            let prev_pivot = self.stack.item(r + 1);
            let new_space = self.stack.item(r);
            let empty_bucket = new_space - prev_pivot == 1;
            self.stack.set(r, new_space + 1);

            if !empty_bucket {
                let bottom = self.key_at(prev_pivot + 1);
                self.move_key(new_space, bottom);
            }

            let pivot_key = self.key_at(prev_pivot);
            self.move_key(prev_pivot + 1, pivot_key);
        }

        let new_space = self.stack.item(si);
        self.stack.set(si, new_space + 1);
        self.move_key(new_space, key);

        self.len += 1;
    }

    /// Partitions a pure, non-empty bucket (necessarily the leftmost when
    /// reached from `find_empty_left`) around a uniformly chosen pivot and
    /// pushes the split point.
    fn partition(&mut self, si: usize) {
        let low = self.bucket_lwb(si);
        let high = self.bucket_upb(si);

        // Hoare does not handle the single-element case; push directly.
        if self.equivalent(low, high) {
            self.stack.push(low);
            return;
        }

        let span = (high + 1 - low) as u32;
        let pivot_at = low + (self.rng.next_u32() % span) as i32;
        let pivot_key = self.key_at(pivot_at);

        if !self.equivalent(pivot_at, low) {
            let low_key = self.key_at(low);
            self.move_key(pivot_at, low_key);
            self.move_key(low, pivot_key);
        }

        // Hoare partition: about a third the writes of Lomuto on random
        // input.
        let mut l = low - 1;
        let mut h = high + 1;
        loop {
            loop {
                h -= 1;
                if self.cmp_keys(self.key_at(h), pivot_key) != Ordering::Greater {
                    break;
                }
            }
            loop {
                l += 1;
                if self.cmp_keys(self.key_at(l), pivot_key) != Ordering::Less {
                    break;
                }
            }
            if l >= h {
                break;
            }
            let (l_key, h_key) = (self.key_at(l), self.key_at(h));
            self.move_key(l, h_key);
            self.move_key(h, l_key);
        }

        // Hoare leaves the pivot wherever the swaps dropped it, but every
        // later operation assumes the stack entry is the pivot's position:
        // recover it through the back-index and land it on the split.
        let reduced_pos = self.slab[pivot_key].pos;
        let pivot_pos = if reduced_pos >= self.reduce(low) as i32 {
            low + (reduced_pos - self.reduce(low) as i32)
        } else {
            high - (self.reduce(high) as i32 - reduced_pos)
        };

        if pivot_pos < h {
            let h_key = self.key_at(h);
            self.move_key(pivot_pos, h_key);
            self.move_key(h, pivot_key);
        } else if pivot_pos > h {
            h += 1;
            let h_key = self.key_at(h);
            self.move_key(pivot_pos, h_key);
            self.move_key(h, pivot_key);
        }

        self.stack.push(h);
    }

    /// Walks toward the minimum: partition each pure bucket met, ascend,
    /// and stop at the first empty subtree: its bounding pivot is the
    /// minimum and sits at the starting index.
    fn find_empty_left(&mut self) -> usize {
        let mut si = 0;
        loop {
            if self.is_bucket(si) {
                self.partition(si);
            }
            si += 1;
            if self.size(si) == 0 {
                return si;
            }
        }
    }

    /// Removes an element from its bucket.
    ///
    /// At the starting index the array just shrinks from the left.
    /// Anywhere else, the bucket's top element fills the gap and each
    /// pivot above shuffles down one slot, peeling levels until the array
    /// shrinks from the right instead.
    fn bucket_delete(&mut self, key: usize) -> T {
        let location = self.slab[key].pos;

        if self.offset(location) == 0 {
            self.idx += 1;
            if self.reduce(self.idx) == 0 {
                self.reduce_indices();
            }
        } else {
            let mut si = self.level_of(self.offset(location));
            let mut location = location;
            loop {
                let top = self.bucket_upb(si);
                if !self.equivalent(location, top) {
                    let top_key = self.key_at(top);
                    self.move_key(location, top_key);
                }
                self.stack.set(si, top);
                if si == 0 {
                    break;
                }
                let pivot_key = self.key_at(top + 1);
                self.move_key(top, pivot_key);
                si -= 1;
                location = top + 1;
            }
        }

        self.len -= 1;
        self.slab.remove(key).data
    }

    /// Stack index of the least pivot at or past the element offset: the
    /// level of the bucket holding that position.
    fn level_of(&self, loc_off: i32) -> usize {
        let mut si = self.stack.depth();
        loop {
            si -= 1;
            if self.stack_offset(si) >= loc_off {
                return si;
            }
        }
    }

    /// Circular offset of stack entry `si` from the starting index; the
    /// fictitious pivot reduces ambiguously when the tree is full, so it
    /// reports the element count directly.
    fn stack_offset(&self, si: usize) -> i32 {
        if si == 0 {
            self.len
        } else {
            self.offset(self.stack.item(si))
        }
    }

    // ========================================================================
    // Circular storage
    // ========================================================================

    /// Doubles the array. The live region is circular, so the wrapped
    /// prefix `[0, idx)` is re-homed into the new upper half to keep it
    /// contiguous, after index normalisation.
    fn expand(&mut self) {
        let old_capacity = self.capacity;

        let old = std::mem::take(&mut self.heap);
        let mut heap = old.into_vec();
        heap.resize(old_capacity as usize * 2, VACANT);
        self.heap = heap.into_boxed_slice();
        self.capacity = old_capacity * 2;

        self.reduce_indices();
        for i in 0..self.idx {
            let key = self.heap[i as usize];
            let new_index = self.slab[key].pos + old_capacity;
            self.move_key(new_index, key);
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

    /// Circular offset of a reduced position from the starting index.
    #[inline]
    fn offset(&self, pos: i32) -> i32 {
        self.reduce(pos - self.idx) as i32
    }

    #[inline]
    fn key_at(&self, at: i32) -> usize {
        self.heap[self.reduce(at)]
    }

    /// Places `key` at `at`, keeping its back-index current.
    #[inline]
    fn move_key(&mut self, at: i32, key: usize) {
        let reduced = self.reduce(at);
        self.heap[reduced] = key;
        self.slab[key].pos = reduced as i32;
    }

    #[inline]
    fn cmp_keys(&self, a: usize, b: usize) -> Ordering {
        self.slab[a].data.cmp(&self.slab[b].data)
    }
}

impl<T, R> fmt::Debug for Lst<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lst")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("idx", &self.idx)
            .field("pivots", &self.stack.depth())
            .finish_non_exhaustive()
    }
}
