//! Symmetric flow hash for software RSS.
//!
//! The ingress thread selects a worker ring with
//! `flow_hash(key) & (ring_count - 1)`. The hash is symmetric (both
//! directions of a connection land on the same worker, so any future
//! per-flow state stays core-local) and deterministic. Distribution
//! quality is explicitly *not* a goal; XOR folding is enough to spread
//! distinct flows and costs a handful of instructions.

use super::parser::{FlowAddrs, FlowKey};

/// Computes the 32-bit symmetric hash of a flow key.
///
/// `flow_hash(k) == flow_hash(k.reversed())` for every key, because XOR is
/// commutative across the swapped fields.
#[must_use]
pub fn flow_hash(key: &FlowKey) -> u32 {
    let addr_bits = match &key.addrs {
        FlowAddrs::V4 { src, dst } => src ^ dst,
        FlowAddrs::V6 { src, dst } => fold_addr(src) ^ fold_addr(dst),
    };
    addr_bits ^ u32::from(key.src_port) ^ u32::from(key.dst_port) ^ u32::from(key.protocol)
}

/// Folds a 128-bit address into 32 bits by XORing its four 32-bit words.
fn fold_addr(addr: &[u8; 16]) -> u32 {
    let mut folded = 0u32;
    for chunk in addr.chunks_exact(4) {
        folded ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    folded
}
