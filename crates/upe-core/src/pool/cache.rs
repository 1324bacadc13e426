//! Per-thread handle caches.
//!
//! Each thread keeps one LIFO cache of up to [`LOCAL_CACHE`] handles for
//! the pool it last touched. The cache holds a strong reference to its
//! pool, so handles cached by a thread flow back to the pool's global
//! stack when the thread exits or when the thread switches pools.

use std::cell::RefCell;
use std::sync::Arc;

use arrayvec::ArrayVec;

use super::{BufHandle, BufferPool, LOCAL_CACHE};

struct LocalCache {
    /// Identity of the bound pool (0 = unbound).
    pool_id: u64,
    /// Keeps the bound pool alive until this cache drains.
    pool: Option<Arc<BufferPool>>,
    /// The cached handles; top of the LIFO is the vector's tail.
    handles: ArrayVec<BufHandle, LOCAL_CACHE>,
}

impl LocalCache {
    const fn unbound() -> Self {
        Self {
            pool_id: 0,
            pool: None,
            handles: ArrayVec::new_const(),
        }
    }

    /// Rebinds the cache to `pool`, first draining any handles that belong
    /// to a previously bound pool back to that pool's global stack.
    fn bind(&mut self, pool: &Arc<BufferPool>) {
        if self.pool_id == pool.id() {
            return;
        }
        if let Some(prev) = self.pool.take() {
            prev.flush_cache(&mut self.handles);
        }
        self.pool_id = pool.id();
        self.pool = Some(Arc::clone(pool));
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        // Thread exit: hand cached handles back to the pool.
        if let Some(pool) = self.pool.take() {
            pool.flush_cache(&mut self.handles);
        }
    }
}

thread_local! {
    static CACHE: RefCell<LocalCache> = const { RefCell::new(LocalCache::unbound()) };
}

/// Cache-first allocation; refills from the global stack when empty.
pub(super) fn alloc(pool: &Arc<BufferPool>) -> Option<BufHandle> {
    CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        cache.bind(pool);
        if let Some(handle) = cache.handles.pop() {
            return Some(handle);
        }
        pool.refill_cache(&mut cache.handles);
        cache.handles.pop()
    })
}

/// Cache-first free; spills the cache bottom to the global stack when
/// full.
pub(super) fn free(pool: &Arc<BufferPool>, handle: BufHandle) {
    CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        cache.bind(pool);
        if cache.handles.is_full() {
            pool.spill_cache(&mut cache.handles);
        }
        cache.handles.push(handle);
    });
}
