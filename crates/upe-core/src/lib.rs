//! # UPE Core
//!
//! The dataplane core of the Userspace Packet Engine: everything that runs
//! per packet, shared by the capture thread and the worker pool.
//!
//! This crate provides:
//! - **Buffer pool**: bounded lock-free pool of fixed-size packet buffers
//!   with per-thread caches
//! - **SPSC rings**: lock-free single-producer single-consumer queues that
//!   carry buffer handles from ingress to workers
//! - **Parser**: zero-copy 5-tuple extraction from raw Ethernet frames
//! - **Rule table**: priority-ordered wildcard classification, frozen after
//!   load, read without synchronization
//! - **Neighbor tables**: passively-learned ARP and NDP maps behind
//!   reader/writer locks
//! - **Workers**: the per-core dequeue → classify → rewrite → batched-send
//!   pipeline
//!
//! ## Design Principles
//!
//! 1. **No locks on the packet path** - rings and the pool are lock-free;
//!    the only locks are in the neighbor tables and are never held across
//!    packet I/O
//! 2. **Shared-nothing by default** - each worker owns its ring, counters,
//!    per-rule stats, and last-hit neighbor caches
//! 3. **Packets are disposable** - every data-plane error frees the buffer,
//!    bumps a counter, and moves on; nothing is retried
//! 4. **Logging is side-channel** - the hot path never synchronizes with a
//!    logger

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the pool's ownership handoff, the ring slots, and
// the libc affinity call; every site carries a SAFETY comment.
#![allow(unsafe_code)]

pub mod affinity;
pub mod neighbor;
pub mod packet;
pub mod pool;
pub mod ring;
pub mod rules;
pub mod stats;
pub mod worker;

// Re-export the types the engine binary wires together.
pub use pool::{BufHandle, BufferPool, PacketBuffer};
pub use ring::SpscRing;
pub use worker::{TxSink, WorkerHandle};

/// Result type for upe-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for upe-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer pool errors.
    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    /// SPSC ring errors.
    #[error("Ring error: {0}")]
    Ring(#[from] ring::RingError),

    /// Rule table errors.
    #[error("Rule error: {0}")]
    Rule(#[from] rules::RuleError),

    /// Worker lifecycle errors.
    #[error("Worker error: {0}")]
    Worker(#[from] worker::WorkerError),

    /// CPU affinity errors.
    #[error("Affinity error: {0}")]
    Affinity(#[from] affinity::AffinityError),
}
