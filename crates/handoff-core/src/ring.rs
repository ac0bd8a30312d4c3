//! `RingQueue`: fixed-capacity single-producer / single-consumer ring.
//!
//! One producer thread moves items in, one consumer thread moves them out.
//! Ownership of an item passes to the consumer at the moment `enqueue`
//! succeeds; a rejected item is handed back inside `QueueFull`.
//!
//! # Counters
//!
//! ```text
//! head: next slot the producer writes   (producer stores, consumer loads)
//! tail: next slot the consumer reads    (consumer stores, producer loads)
//!
//! index = counter & mask
//! empty:  head == tail
//! full:   head - tail == capacity - 1
//! ```
//!
//! Both counters only increase and wrap at `usize::MAX`; every comparison
//! uses wrapping subtraction. One slot is left unused so the two counters
//! alone tell "full" from "empty".
//!
//! # Atomics
//!
//! The producer writes the slot, then publishes `head` with Release. The
//! consumer loads `head` with Acquire before reading the slot, then
//! publishes `tail` with Release so the producer may reuse it. Each counter
//! lives on its own cache line.
//!
//! # SPSC contract
//!
//! `split()` takes `&mut self` and hands out exactly one `Producer` and one
//! `Consumer`. Neither is `Clone`, and both `enqueue` and `dequeue` take
//! `&mut self`, so a second producer or consumer cannot exist while the
//! halves are alive.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{QueueError, QueueFull};

/// Largest capacity `with_capacity` accepts.
pub const MAX_CAPACITY: usize = 1024;

/// Pads a counter out to a full cache line.
#[repr(C, align(64))]
struct CacheAligned<T>(T);

pub struct RingQueue<T> {
    /// Producer position.
    head: CacheAligned<AtomicUsize>,
    /// Consumer position.
    tail: CacheAligned<AtomicUsize>,
    /// capacity - 1 (for fast modulo via bitwise AND).
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: a slot is written only by the producer while it is outside
// [tail, head), and read only by the consumer while it is inside. The
// Release/Acquire pair on head/tail orders those accesses.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Create a ring with `capacity` slots (`capacity - 1` usable).
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        Self::with_start(capacity, 0)
    }

    fn with_start(capacity: usize, start: usize) -> Result<Self, QueueError> {
        if capacity == 0 || capacity > MAX_CAPACITY || !capacity.is_power_of_two() {
            return Err(QueueError::InvalidCapacity(capacity));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::OutOfMemory)?;
        slots.extend((0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())));

        Ok(Self {
            head: CacheAligned(AtomicUsize::new(start)),
            tail: CacheAligned(AtomicUsize::new(start)),
            mask: capacity - 1,
            slots: slots.into_boxed_slice(),
        })
    }

    /// Total slots, including the reserved one.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Items the ring can hold at once.
    #[inline]
    pub fn usable(&self) -> usize {
        self.mask
    }

    /// Items currently queued. Exact only when neither side is active.
    pub fn len(&self) -> usize {
        // tail first: head read afterwards can only be >= this tail.
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.mask)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the single producer and single consumer.
    pub fn split(&mut self) -> (Producer<'_, T>, Consumer<'_, T>) {
        let ring: &Self = self;
        (Producer { ring }, Consumer { ring })
    }

    #[inline(always)]
    fn slot(&self, pos: usize) -> *mut MaybeUninit<T> {
        self.slots[pos & self.mask].get()
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let mut tail = *self.tail.0.get_mut();
        while tail != head {
            // Safety: [tail, head) holds initialized items and no half is alive.
            unsafe { (*self.slots[tail & self.mask].get()).assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// The write half. Lives on the producer thread.
pub struct Producer<'a, T> {
    ring: &'a RingQueue<T>,
}

impl<T> Producer<'_, T> {
    /// Move `item` into the ring.
    ///
    /// Returns `Err(QueueFull(item))` without blocking when `capacity - 1`
    /// items are already queued.
    pub fn enqueue(&mut self, item: T) -> Result<(), QueueFull<T>> {
        let ring = self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= ring.mask {
            return Err(QueueFull(item));
        }

        // Safety: slot `head` is outside [tail, head), so the consumer is
        // not reading it, and this is the only producer.
        unsafe { (*ring.slot(head)).write(item) };
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.ring.len() >= self.ring.mask
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// The read half. Lives on the consumer thread.
pub struct Consumer<'a, T> {
    ring: &'a RingQueue<T>,
}

impl<T> Consumer<'_, T> {
    /// Take the oldest item, or `None` when the ring is empty.
    ///
    /// An empty dequeue changes nothing.
    pub fn dequeue(&mut self) -> Option<T> {
        let ring = self.ring;
        let tail = ring.tail.0.load(Ordering::Relaxed);
        let head = ring.head.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // Safety: slot `tail` is inside [tail, head) and was published by
        // the Release store of head that the Acquire load above observed.
        let item = unsafe { (*ring.slot(tail)).assume_init_read() };
        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
