//! # Packet Buffer Pool
//!
//! Bounded pool of fixed-size packet buffers with a two-tier free list:
//! a process-wide lock-free stack of buffer handles, fronted by a
//! per-thread LIFO cache.
//!
//! ## Design
//!
//! - All buffers live in one contiguous allocation (huge pages when the
//!   kernel grants them, see [`BackingKind`])
//! - A handle is an index into that allocation; the ring transports
//!   handles, never buffer contents
//! - The global free list is a stack of handles with a single atomic top
//!   index; a burst pop reserves a whole range with one CAS
//! - Each thread keeps up to [`LOCAL_CACHE`] handles in a private LIFO and
//!   only touches the global stack in bursts of [`LOCAL_CACHE`]`/2`
//!
//! ## Ownership discipline
//!
//! Every buffer has exactly one logical owner at any moment: the free
//! stack, a thread-local cache, a ring slot, or a worker (directly or via
//! its TX batch). `alloc` transfers ownership to the caller; `free`
//! transfers it back. [`BufferPool::buffer_mut`] is `unsafe` because the
//! compiler cannot see these transfers; callers assert ownership.

mod cache;
mod storage;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::ring::CachePadded;

pub use storage::BackingKind;
use storage::Storage;

/// Maximum handles kept in a thread-local cache.
pub const LOCAL_CACHE: usize = 64;

/// Handles moved between a thread cache and the global stack per refill or
/// spill.
pub(crate) const XFER_BURST: usize = LOCAL_CACHE / 2;

/// Process-unique pool identities, used to bind thread caches to pools.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors from pool construction.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The requested capacity is zero.
    #[error("pool capacity must be > 0")]
    ZeroCapacity,

    /// The requested capacity does not fit the 32-bit handle index space.
    #[error("pool capacity {0} exceeds the handle index range")]
    CapacityOverflow(usize),
}

/// Fixed-capacity storage for one Ethernet frame.
///
/// Holds up to [`PacketBuffer::CAPACITY`] bytes plus the payload length and
/// an optional ingress timestamp (monotonic nanoseconds; 0 = unset).
#[repr(C)]
pub struct PacketBuffer {
    len: u32,
    ingress_ts_ns: u64,
    data: [u8; Self::CAPACITY],
}

impl PacketBuffer {
    /// Payload capacity in bytes (covers standard MTU frames).
    pub const CAPACITY: usize = 2048;

    /// Creates an empty buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            ingress_ts_ns: 0,
            data: [0; Self::CAPACITY],
        }
    }

    /// Current payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the buffer holds no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `frame` into the buffer, truncating to
    /// [`PacketBuffer::CAPACITY`], and sets the payload length.
    ///
    /// Returns the number of bytes stored.
    pub fn fill(&mut self, frame: &[u8]) -> usize {
        let n = frame.len().min(Self::CAPACITY);
        self.data[..n].copy_from_slice(&frame[..n]);
        #[allow(clippy::cast_possible_truncation)] // n <= CAPACITY < u32::MAX
        {
            self.len = n as u32;
        }
        n
    }

    /// The stored payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// The stored payload, mutable (for in-place header rewrites).
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len as usize]
    }

    /// Ingress timestamp in monotonic nanoseconds, 0 if never set.
    #[must_use]
    pub fn ingress_ts_ns(&self) -> u64 {
        self.ingress_ts_ns
    }

    /// Records the ingress timestamp (monotonic nanoseconds).
    pub fn set_ingress_ts_ns(&mut self, ts_ns: u64) {
        self.ingress_ts_ns = ts_ns;
    }

    /// Clears payload length and timestamp. Called on free.
    fn reset(&mut self) {
        self.len = 0;
        self.ingress_ts_ns = 0;
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len)
            .field("ingress_ts_ns", &self.ingress_ts_ns)
            .finish_non_exhaustive()
    }
}

/// Handle to a [`PacketBuffer`] inside its pool.
///
/// Handles are plain indices: cheap to copy, cheap to push through a ring.
/// A handle is only meaningful together with the pool that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufHandle(u32);

impl BufHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lock-free stack of free handles: a pre-allocated slot array plus an
/// atomic top index.
///
/// Pop reserves the range `[new_top, old_top)` with one CAS on `top`; the
/// reserved slots then belong to the popper. Push writes its handles into
/// the slots at the current top *first* and publishes them with a CAS
/// afterwards; advancing `top` before writing would expose unwritten
/// slots to a concurrent popper. Because the slot array is pre-allocated
/// and the CAS is on the top index alone, there is no node-reuse hazard.
struct FreeStack {
    slots: Box<[AtomicU32]>,
    top: CachePadded<AtomicUsize>,
}

impl FreeStack {
    /// A stack holding every handle `0..capacity`.
    fn full(capacity: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)] // capacity checked against u32 range
        let slots: Vec<AtomicU32> = (0..capacity).map(|i| AtomicU32::new(i as u32)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            top: CachePadded::new(AtomicUsize::new(capacity)),
        }
    }

    /// Number of handles currently in the stack (snapshot; excludes
    /// handles parked in thread caches).
    fn len(&self) -> usize {
        self.top.load(Ordering::Relaxed)
    }

    /// Pops up to `max` handles into `out`. Returns the number popped.
    fn pop_chunk(&self, out: &mut ArrayVec<BufHandle, LOCAL_CACHE>, max: usize) -> usize {
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            if top == 0 {
                return 0;
            }
            let take = max.min(top);
            let new_top = top - take;
            match self
                .top
                .compare_exchange(top, new_top, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // The range [new_top, top) is reserved for this popper.
                    for i in 0..take {
                        out.push(BufHandle(self.slots[new_top + i].load(Ordering::Relaxed)));
                    }
                    return take;
                }
                Err(current) => top = current,
            }
        }
    }

    /// Pushes `handles` onto the stack.
    ///
    /// Cannot overflow: the handle population is fixed at the pool's
    /// capacity, which is exactly the slot count.
    fn push_chunk(&self, handles: &[BufHandle]) {
        if handles.is_empty() {
            return;
        }
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            for (i, h) in handles.iter().enumerate() {
                self.slots[top + i].store(h.0, Ordering::Relaxed);
            }
            match self.top.compare_exchange(
                top,
                top + handles.len(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                // Writes above are discarded; retry from the new top.
                Err(current) => top = current,
            }
        }
    }
}

/// Bounded pool of [`PacketBuffer`]s with per-thread caches.
///
/// Pools are used through an [`Arc`]: `alloc` and `free` bind the calling
/// thread's cache to the pool, and the cache keeps its pool alive until
/// the thread exits (at which point the cached handles drain back to the
/// global stack). Destruction is not concurrent-safe beyond that: the last
/// `Arc` must be dropped only after all users have quiesced, and any
/// handle still logically owned elsewhere at that point is leaked.
pub struct BufferPool {
    storage: Storage,
    free: FreeStack,
    id: u64,
}

// SAFETY: buffers are only reached through handles, and the ownership
// discipline guarantees a handle is held by one thread at a time; the free
// stack is lock-free.
unsafe impl Send for BufferPool {}
// SAFETY: see Send.
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Creates a pool of `capacity` buffers, all initially free.
    ///
    /// Backing memory preference: 2 MiB huge pages, then a plain anonymous
    /// mapping, then the heap. The chosen path is logged and reported by
    /// [`BufferPool::backing`]; it does not affect behavior.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero capacity or one that does not fit the
    /// handle index range.
    pub fn with_capacity(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        if capacity >= u32::MAX as usize {
            return Err(PoolError::CapacityOverflow(capacity));
        }

        let storage = Storage::allocate(capacity);
        tracing::info!(
            capacity,
            backing = %storage.kind(),
            "packet buffer pool initialized"
        );

        Ok(Self {
            storage,
            free: FreeStack::full(capacity),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Total number of buffers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Which backing memory path succeeded at init.
    #[must_use]
    pub fn backing(&self) -> BackingKind {
        self.storage.kind()
    }

    /// Free handles in the global stack (snapshot, approximate: handles
    /// parked in thread-local caches are not counted).
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Allocates a buffer, transferring ownership of the handle to the
    /// caller.
    ///
    /// Fast path: pop from the calling thread's cache. Slow path: refill
    /// the cache with a burst from the global stack. Returns `None` when
    /// both tiers are empty.
    #[must_use]
    pub fn alloc(self: &Arc<Self>) -> Option<BufHandle> {
        cache::alloc(self)
    }

    /// Returns a buffer to the pool, ending the caller's ownership.
    ///
    /// Fast path: push onto the calling thread's cache. Slow path: spill a
    /// burst from the cache bottom to the global stack first.
    pub fn free(self: &Arc<Self>, handle: BufHandle) {
        // SAFETY: the caller transfers ownership of `handle` by calling
        // free; no other thread can reach this buffer until it is
        // re-allocated.
        unsafe { (*self.storage.get(handle.index())).reset() };
        cache::free(self, handle);
    }

    /// Borrows the buffer behind `handle`.
    ///
    /// # Safety
    ///
    /// The caller must own `handle` per the pool's transfer discipline
    /// (obtained from `alloc` or a ring, not yet freed or batched away)
    /// and must not hold an aliasing `buffer_mut` borrow.
    #[must_use]
    pub unsafe fn buffer(&self, handle: BufHandle) -> &PacketBuffer {
        &*self.storage.get(handle.index())
    }

    /// Mutably borrows the buffer behind `handle`.
    ///
    /// # Safety
    ///
    /// Same ownership requirement as [`BufferPool::buffer`], and the
    /// borrow must be unique.
    #[must_use]
    #[allow(clippy::mut_from_ref)] // handle ownership stands in for &mut self
    pub unsafe fn buffer_mut(&self, handle: BufHandle) -> &mut PacketBuffer {
        &mut *self.storage.get(handle.index())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Moves up to [`XFER_BURST`] handles from the global stack into a
    /// thread cache.
    pub(crate) fn refill_cache(&self, into: &mut ArrayVec<BufHandle, LOCAL_CACHE>) {
        self.free.pop_chunk(into, XFER_BURST);
    }

    /// Spills [`XFER_BURST`] handles from the *bottom* (oldest end) of a
    /// full thread cache back to the global stack.
    pub(crate) fn spill_cache(&self, from: &mut ArrayVec<BufHandle, LOCAL_CACHE>) {
        let mut spill = ArrayVec::<BufHandle, XFER_BURST>::new();
        spill.extend(from.drain(..XFER_BURST));
        self.free.push_chunk(&spill);
    }

    /// Returns every cached handle to the global stack (pool switch or
    /// thread exit).
    pub(crate) fn flush_cache(&self, from: &mut ArrayVec<BufHandle, LOCAL_CACHE>) {
        self.free.push_chunk(from);
        from.clear();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("backing", &self.backing())
            .finish()
    }
}
