//! # SPSC Ring
//!
//! Lock-free single-producer single-consumer bounded queue connecting the
//! ingress thread to a worker.
//!
//! ## Design
//!
//! - Cache-line padded head/tail cursors prevent false sharing
//! - Power-of-2 capacity for fast modulo via bitmask; anything else is
//!   rejected at init
//! - Monotonic cursors: `head` and `tail` count forever and wrap naturally
//!   in the unsigned counter space, so `head - tail` is always the number of
//!   items in flight and the full capacity is usable
//! - Acquire/Release handshake on the cursors: a slot's payload write
//!   happens-before the consumer's read of that slot
//! - Burst push/pop amortize the atomic traffic over whole batches

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A wrapper that pads a value to a cache line boundary to prevent false
/// sharing.
///
/// False sharing occurs when two threads access different data that happens
/// to reside on the same cache line, causing unnecessary cache
/// invalidations. The producer-owned and consumer-owned cursors of a ring
/// each get their own line.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

// SAFETY: CachePadded is Send if T is Send
unsafe impl<T: Send> Send for CachePadded<T> {}

// SAFETY: CachePadded is Sync if T is Sync
unsafe impl<T: Sync> Sync for CachePadded<T> {}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePadded")
            .field("value", &self.value)
            .finish()
    }
}

/// Errors from ring construction.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The requested capacity is zero.
    #[error("ring capacity must be > 0")]
    ZeroCapacity,

    /// The requested capacity is not a power of two.
    ///
    /// Capacities are not rounded up: a mis-sized ring is a configuration
    /// bug and is rejected at startup.
    #[error("ring capacity must be a power of two, got {0}")]
    CapacityNotPowerOfTwo(usize),
}

/// A lock-free single-producer single-consumer bounded FIFO of `Copy`
/// values (in the dataplane: buffer handles).
///
/// # Safety contract
///
/// The ring itself is safe to use from safe code, but it is only *correct*
/// when exactly one thread pushes and exactly one thread pops for the
/// ring's lifetime. Concurrent producers (or consumers) race on the plain
/// slot accesses and will corrupt the queue contents; there is no
/// multi-producer or multi-consumer mode.
///
/// # Example
///
/// ```rust
/// use upe_core::ring::SpscRing;
///
/// let ring: SpscRing<usize> = SpscRing::with_capacity(8).unwrap();
///
/// // Producer side
/// assert_eq!(ring.push_burst(&[1, 2, 3]), 3);
///
/// // Consumer side
/// assert_eq!(ring.pop(), Some(1));
/// assert_eq!(ring.pop(), Some(2));
/// assert_eq!(ring.pop(), Some(3));
/// assert_eq!(ring.pop(), None);
/// ```
pub struct SpscRing<T> {
    /// Slot array; index = cursor & mask.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Producer cursor, monotonically non-decreasing.
    head: CachePadded<AtomicUsize>,
    /// Consumer cursor, monotonically non-decreasing.
    tail: CachePadded<AtomicUsize>,
    /// Capacity mask (capacity - 1).
    mask: usize,
}

// SAFETY: the ring can be shared between the one producer and the one
// consumer as long as T can be sent across threads. The Release store of a
// cursor publishes the slot writes that precede it.
unsafe impl<T: Send> Send for SpscRing<T> {}

// SAFETY: see Send; all shared mutation goes through the atomic cursors.
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Creates a ring with the given capacity.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::ZeroCapacity`] for capacity 0 and
    /// [`RingError::CapacityNotPowerOfTwo`] for any capacity that is not a
    /// power of two.
    pub fn with_capacity(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        if !capacity.is_power_of_two() {
            return Err(RingError::CapacityNotPowerOfTwo(capacity));
        }

        let slots: Vec<UnsafeCell<MaybeUninit<T>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

        Ok(Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        })
    }

    /// Returns the ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns the number of items currently in flight.
    ///
    /// A snapshot; either cursor may move immediately after.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Returns true if the ring is empty (snapshot).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes up to `objs.len()` items, preserving order.
    ///
    /// Returns the number actually pushed: `min(objs.len(), free slots)`.
    /// A short return means the ring is (partially) full; the caller
    /// decides whether to drop or back off. Never blocks.
    ///
    /// Must only be called by the ring's single producer.
    pub fn push_burst(&self, objs: &[T]) -> usize {
        // Own cursor: relaxed. Peer cursor: acquire, so the free-slot count
        // can only underestimate (the consumer may free more concurrently).
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let free = self.capacity() - head.wrapping_sub(tail);
        let count = objs.len().min(free);
        if count == 0 {
            return 0;
        }

        for (i, obj) in objs.iter().take(count).enumerate() {
            // SAFETY: slots at cursors >= head are unpublished and owned by
            // the producer; the consumer reads only cursors below head.
            unsafe {
                (*self.slots[head.wrapping_add(i) & self.mask].get()).write(*obj);
            }
        }

        // Release: publishes the slot writes above to the consumer.
        self.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    /// Pushes a single item. Returns false if the ring is full.
    ///
    /// Must only be called by the ring's single producer.
    pub fn push(&self, obj: T) -> bool {
        self.push_burst(std::slice::from_ref(&obj)) == 1
    }

    /// Pops up to `out.len()` items into `out`, preserving order.
    ///
    /// Returns the number popped; the first `n` elements of `out` are
    /// initialized afterwards. Returns 0 when the ring is empty (the
    /// worker's cue to check the stop flag and briefly sleep). Never
    /// blocks.
    ///
    /// Must only be called by the ring's single consumer.
    pub fn pop_burst(&self, out: &mut [MaybeUninit<T>]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        // Acquire pairs with the producer's release store of head: every
        // slot below head is fully written before we read it.
        let head = self.head.load(Ordering::Acquire);

        let entries = head.wrapping_sub(tail);
        let count = out.len().min(entries);
        if count == 0 {
            return 0;
        }

        for (i, slot) in out.iter_mut().take(count).enumerate() {
            // SAFETY: slots in [tail, head) are published by the producer
            // and owned by the consumer until tail advances past them.
            unsafe {
                slot.write((*self.slots[tail.wrapping_add(i) & self.mask].get()).assume_init());
            }
        }

        // Release: hands the consumed slots back to the producer.
        self.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// Pops a single item, or `None` if the ring is empty.
    ///
    /// Must only be called by the ring's single consumer.
    pub fn pop(&self) -> Option<T> {
        let mut slot = MaybeUninit::uninit();
        if self.pop_burst(std::slice::from_mut(&mut slot)) == 1 {
            // SAFETY: pop_burst initialized the slot.
            Some(unsafe { slot.assume_init() })
        } else {
            None
        }
    }
}

impl<T: Copy> std::fmt::Debug for SpscRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
