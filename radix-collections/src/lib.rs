//! Randomized, cache-oblivious priority queues.
//!
//! Two alternatives to the classical binary heap, both built on a
//! circular array and a stack of pivot indices:
//!
//! - [`QuickHeap`]: incremental quicksort exposes the minimum on demand.
//! - [`Lst`]: the leftmost skeleton tree refines the quickheap with O(1)
//!   amortised pop and arbitrary deletion through stable [`Key`] handles.
//!
//! Both are single-threaded and generic over a [`rand_core::RngCore`]
//! source, so tests run deterministically from a seed.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

mod lst;
mod quickheap;
mod stack;

pub use lst::{Key, Lst};
pub use quickheap::QuickHeap;
pub use stack::PivotStack;
