//! Bounded lock-free single-producer/single-consumer queue.
//!
//! This is the data path between a network thread and a worker thread:
//! each direction of a request/reply channel owns one queue, with exactly
//! one writer and one reader by construction. The queue itself never
//! blocks and never signals; waking the peer is the caller's problem
//! (see `radix-channel`).
//!
//! # Design
//!
//! A power-of-two ring with acquire/release head/tail indices on separate
//! cache lines. Each handle keeps a private copy of its own index and a
//! cached snapshot of the peer's, so the hot path performs no atomic loads
//! at all; the peer's index is only re-read when the queue looks full
//! (producer) or empty (consumer).
//!
//! # Example
//!
//! ```
//! let (mut tx, mut rx) = radix_queue::queue::<u64>(1024);
//!
//! tx.push(7).unwrap();
//! assert_eq!(rx.pop(), Some(7));
//! assert_eq!(rx.pop(), None);
//! ```
//!
//! # Disconnection
//!
//! Dropping either handle marks the queue disconnected. A disconnected
//! queue still drains: the consumer can pop everything the producer queued
//! before going away.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

mod ring;

use std::fmt;
use std::ptr::NonNull;

use ring::Ring;

/// Error returned when pushing to a full queue.
///
/// Carries the rejected value so the caller keeps ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Returns the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is full")
    }
}

impl<T: fmt::Debug> std::error::Error for Full<T> {}

/// Creates a bounded SPSC queue with at least `capacity` slots.
///
/// Capacity is rounded up to the next power of two (minimum 2).
pub fn queue<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let inner = Ring::<T>::allocate(capacity);

    (
        Producer {
            inner,
            tail: 0,
            cached_head: 0,
        },
        Consumer {
            inner,
            head: 0,
            cached_tail: 0,
        },
    )
}

/// The writing half of an SPSC queue.
///
/// `Send` but not `Sync`: exactly one thread may own it at a time, and
/// `push` takes `&mut self` so single-producer access is enforced
/// statically.
pub struct Producer<T> {
    inner: NonNull<Ring<T>>,

    /// Authoritative write position; only we advance it.
    tail: usize,
    /// Snapshot of the consumer's read position, refreshed only when the
    /// queue appears full.
    cached_head: usize,
}

unsafe impl<T: Send> Send for Producer<T> {}

impl<T> Producer<T> {
    /// Pushes a value, failing with [`Full`] when the ring has no space.
    ///
    /// A full queue means the consumer has fallen at least `capacity`
    /// items behind; the caller decides whether that is backpressure or an
    /// error.
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), Full<T>> {
        let ring = unsafe { self.inner.as_ref() };

        if self.tail.wrapping_sub(self.cached_head) >= ring.capacity() {
            // Looks full; refresh the consumer's position before giving up.
            self.cached_head = ring.head();
            if self.tail.wrapping_sub(self.cached_head) >= ring.capacity() {
                return Err(Full(value));
            }
        }

        unsafe { ring.write(self.tail, value) };
        self.tail = self.tail.wrapping_add(1);
        ring.publish_tail(self.tail);
        Ok(())
    }

    /// Returns the queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if the consumer has been dropped.
    ///
    /// May be stale the moment it returns.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        unsafe { self.inner.as_ref().consumer_gone() }
    }

    /// Returns a snapshot of the number of queued values.
    #[inline]
    pub fn len(&self) -> usize {
        let ring = unsafe { self.inner.as_ref() };
        ring.tail().wrapping_sub(ring.head())
    }

    /// Returns `true` if the queue currently looks empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        unsafe {
            self.inner.as_ref().mark_producer_gone();
            Ring::release(self.inner);
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// The reading half of an SPSC queue.
///
/// `Send` but not `Sync`; `pop` takes `&mut self` so single-consumer
/// access is enforced statically.
pub struct Consumer<T> {
    inner: NonNull<Ring<T>>,

    /// Authoritative read position; only we advance it.
    head: usize,
    /// Snapshot of the producer's write position, refreshed only when the
    /// queue appears empty.
    cached_tail: usize,
}

unsafe impl<T: Send> Send for Consumer<T> {}

impl<T> Consumer<T> {
    /// Pops the oldest queued value, or `None` if the queue is empty.
    ///
    /// An empty queue is not an error; a drained-and-disconnected queue is
    /// observable via [`is_disconnected`](Consumer::is_disconnected).
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let ring = unsafe { self.inner.as_ref() };

        if self.head == self.cached_tail {
            // Looks empty; refresh the producer's position before giving up.
            self.cached_tail = ring.tail();
            if self.head == self.cached_tail {
                return None;
            }
        }

        let value = unsafe { ring.read(self.head) };
        self.head = self.head.wrapping_add(1);
        ring.publish_head(self.head);
        Some(value)
    }

    /// Returns the queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if the producer has been dropped.
    ///
    /// Queued values remain poppable after disconnection.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        unsafe { self.inner.as_ref().producer_gone() }
    }

    /// Returns a snapshot of the number of queued values.
    #[inline]
    pub fn len(&self) -> usize {
        let ring = unsafe { self.inner.as_ref() };
        ring.tail().wrapping_sub(ring.head())
    }

    /// Returns `true` if the queue currently looks empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        unsafe {
            self.inner.as_ref().mark_consumer_gone();
            Ring::release(self.inner);
        }
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}
