//! Shared ring storage for the SPSC queue.
//!
//! One heap allocation holds the header (indices, disconnect flags,
//! reference count) and a separately allocated slot array. The producer
//! and consumer handles each hold one reference; the last handle dropped
//! frees everything, including any values never popped.

use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Backing storage shared by a producer/consumer pair.
///
/// `head` is the consumer's read position, `tail` the producer's write
/// position; both increase without bound and are masked into the slot
/// array. They live on separate cache lines so the two threads never
/// contend on the same line for their own index.
pub(crate) struct Ring<T> {
    tail: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,

    slots: *mut T,
    capacity: usize,
    mask: usize,

    refs: AtomicUsize,
    producer_gone: AtomicBool,
    consumer_gone: AtomicBool,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Allocates a ring with capacity rounded up to a power of two
    /// (minimum 2). The returned pointer carries a reference count of 2.
    pub(crate) fn allocate(capacity: usize) -> NonNull<Self> {
        let capacity = capacity.next_power_of_two().max(2);

        // Vec gives us a correctly aligned slot array; we take the pointer
        // and reconstruct the Vec at release time.
        let slots = ManuallyDrop::new(Vec::<T>::with_capacity(capacity)).as_mut_ptr();

        let ring = Box::new(Self {
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            slots,
            capacity,
            mask: capacity - 1,
            refs: AtomicUsize::new(2),
            producer_gone: AtomicBool::new(false),
            consumer_gone: AtomicBool::new(false),
        });

        unsafe { NonNull::new_unchecked(Box::into_raw(ring)) }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn publish_tail(&self, tail: usize) {
        self.tail.store(tail, Ordering::Release);
    }

    #[inline]
    pub(crate) fn publish_head(&self, head: usize) {
        self.head.store(head, Ordering::Release);
    }

    /// Writes `value` into the slot for `index`.
    ///
    /// # Safety
    ///
    /// The caller must be the sole producer and the slot must be free.
    #[inline]
    pub(crate) unsafe fn write(&self, index: usize, value: T) {
        unsafe { self.slots.add(index & self.mask).write(value) }
    }

    /// Moves the value out of the slot for `index`.
    ///
    /// # Safety
    ///
    /// The caller must be the sole consumer and the slot must hold a value.
    #[inline]
    pub(crate) unsafe fn read(&self, index: usize) -> T {
        unsafe { self.slots.add(index & self.mask).read() }
    }

    #[inline]
    pub(crate) fn producer_gone(&self) -> bool {
        self.producer_gone.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn consumer_gone(&self) -> bool {
        self.consumer_gone.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn mark_producer_gone(&self) {
        self.producer_gone.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn mark_consumer_gone(&self) {
        self.consumer_gone.store(true, Ordering::Release);
    }

    /// Drops one reference; the second release drops any queued values and
    /// frees the allocation.
    ///
    /// # Safety
    ///
    /// Only callable from a handle's `Drop`; the pointer must not be used
    /// afterwards.
    pub(crate) unsafe fn release(this: NonNull<Self>) {
        let ring = unsafe { this.as_ref() };

        if ring.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Sole owner now; plain loads suffice.
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Relaxed);

        unsafe {
            for i in head..tail {
                ptr::drop_in_place(ring.slots.add(i & ring.mask));
            }
            let _ = Vec::from_raw_parts(ring.slots, 0, ring.capacity);
            let _ = Box::from_raw(this.as_ptr());
        }
    }
}
