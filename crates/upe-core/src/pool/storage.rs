//! Backing memory for the buffer array.
//!
//! One contiguous region holds every [`PacketBuffer`] of a pool. The
//! preferred backing is a 2 MiB huge-page mapping (fewer TLB misses on the
//! hot path), falling back to a plain anonymous mapping and finally to the
//! heap. Which path succeeded is recorded for diagnostics only.

use super::PacketBuffer;

/// Which backing memory path succeeded at pool init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// Anonymous mapping backed by 2 MiB huge pages.
    HugePages,
    /// Plain anonymous mapping.
    Mmap,
    /// Heap allocation.
    Heap,
}

impl std::fmt::Display for BackingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HugePages => write!(f, "hugepages"),
            Self::Mmap => write!(f, "mmap"),
            Self::Heap => write!(f, "heap"),
        }
    }
}

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub(super) struct Storage {
    ptr: *mut PacketBuffer,
    capacity: usize,
    kind: BackingKind,
    /// Mapping length in bytes; 0 when heap-backed.
    map_len: usize,
    /// Owns the buffers on the heap fallback path.
    _heap: Option<Box<[PacketBuffer]>>,
}

impl Storage {
    /// Allocates zero-initialized storage for `capacity` buffers.
    ///
    /// An all-zero byte pattern is a valid empty [`PacketBuffer`], so both
    /// mapping paths hand out ready-to-use buffers.
    pub(super) fn allocate(capacity: usize) -> Self {
        let bytes = capacity * std::mem::size_of::<PacketBuffer>();

        #[cfg(target_os = "linux")]
        {
            let huge_len = bytes.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE;
            if let Some(ptr) = map_anonymous(huge_len, libc::MAP_HUGETLB) {
                return Self {
                    ptr: ptr.cast::<PacketBuffer>(),
                    capacity,
                    kind: BackingKind::HugePages,
                    map_len: huge_len,
                    _heap: None,
                };
            }
        }

        if let Some(ptr) = map_anonymous(bytes, 0) {
            return Self {
                ptr: ptr.cast::<PacketBuffer>(),
                capacity,
                kind: BackingKind::Mmap,
                map_len: bytes,
                _heap: None,
            };
        }

        let mut heap: Box<[PacketBuffer]> =
            (0..capacity).map(|_| PacketBuffer::new()).collect();
        let ptr = heap.as_mut_ptr();
        Self {
            ptr,
            capacity,
            kind: BackingKind::Heap,
            map_len: 0,
            _heap: Some(heap),
        }
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn kind(&self) -> BackingKind {
        self.kind
    }

    /// Raw pointer to the buffer at `index`.
    pub(super) fn get(&self, index: usize) -> *mut PacketBuffer {
        debug_assert!(index < self.capacity);
        // SAFETY: index is within the allocation (handles are minted by the
        // pool and never exceed capacity).
        unsafe { self.ptr.add(index) }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.map_len > 0 {
            // SAFETY: the region was mapped by map_anonymous with exactly
            // this length and is not referenced past the pool's lifetime.
            unsafe {
                libc::munmap(self.ptr.cast::<libc::c_void>(), self.map_len);
            }
        }
    }
}

/// Maps `len` zeroed bytes anonymously; `extra_flags` selects huge pages.
fn map_anonymous(len: usize, extra_flags: libc::c_int) -> Option<*mut u8> {
    // SAFETY: anonymous private mapping with no file descriptor; the
    // kernel either grants it or returns MAP_FAILED.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr.cast::<u8>())
    }
}
