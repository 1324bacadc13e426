//! # Neighbor Tables
//!
//! Passively-learned IP → MAC maps for ARP (IPv4) and NDP (IPv6).
//!
//! ## Design
//!
//! - Open addressing with linear probing over a fixed slot array
//! - No deletion and no expiry: a miss can stop probing at the first empty
//!   slot, because nothing is ever tombstoned; when the table fills,
//!   further learning silently stops (learning is best-effort)
//! - A `parking_lot` reader/writer lock guards the slots. Workers take the
//!   write lock only on control-plane packets (ARP replies, NDP NS/NA) and
//!   the read lock only on a last-hit-cache miss; the lock is never held
//!   across packet I/O
//!
//! The ARP and NDP variants differ only in key type and initial hashing,
//! so both are instances of [`NeighborTable`] over their key family.

use std::time::Instant;

use parking_lot::RwLock;

use crate::packet::headers::MacAddr;

/// A key family usable in a [`NeighborTable`]: hashes itself to an initial
/// probe slot.
pub trait NeighborKey: Copy + Eq + std::fmt::Debug {
    /// Initial probe index for this key in a table of `capacity` slots.
    fn slot_index(&self, capacity: usize) -> usize;
}

impl NeighborKey for u32 {
    /// IPv4 addresses spread well enough by plain modulo.
    fn slot_index(&self, capacity: usize) -> usize {
        *self as usize % capacity
    }
}

impl NeighborKey for [u8; 16] {
    /// IPv6 addresses fold to 32 bits by XORing the four address words.
    fn slot_index(&self, capacity: usize) -> usize {
        let mut folded = 0u32;
        for chunk in self.chunks_exact(4) {
            folded ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        folded as usize % capacity
    }
}

/// One learned neighbor.
#[derive(Debug, Clone, Copy)]
struct NeighborEntry<K> {
    key: K,
    mac: MacAddr,
    /// Kept for observability; entries never expire.
    updated_at: Instant,
}

/// Open-addressed neighbor map guarded by a reader/writer lock.
pub struct NeighborTable<K: NeighborKey> {
    slots: RwLock<Box<[Option<NeighborEntry<K>>]>>,
    capacity: usize,
}

/// The ARP table: IPv4 address (host order) → MAC.
pub type ArpTable = NeighborTable<u32>;

/// The NDP table: IPv6 address (wire order) → MAC.
pub type NdpTable = NeighborTable<[u8; 16]>;

impl<K: NeighborKey> NeighborTable<K> {
    /// Creates a table with a fixed number of slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "neighbor table capacity must be > 0");
        Self {
            slots: RwLock::new(vec![None; capacity].into_boxed_slice()),
            capacity,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of learned entries (takes the read lock).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true if nothing has been learned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Learns or refreshes `key → mac`.
    ///
    /// Probes from the key's hash slot: an empty slot is claimed, a slot
    /// holding `key` is overwritten (latest MAC wins). After a full
    /// revolution without placement the update is silently dropped: with
    /// no expiry, a full table cannot learn anything new.
    pub fn update(&self, key: K, mac: MacAddr) {
        let start = key.slot_index(self.capacity);
        let mut slots = self.slots.write();

        for step in 0..self.capacity {
            let idx = (start + step) % self.capacity;
            match &mut slots[idx] {
                slot @ None => {
                    *slot = Some(NeighborEntry {
                        key,
                        mac,
                        updated_at: Instant::now(),
                    });
                    return;
                }
                Some(entry) if entry.key == key => {
                    entry.mac = mac;
                    entry.updated_at = Instant::now();
                    return;
                }
                Some(_) => {}
            }
        }
    }

    /// Looks up the MAC learned for `key`.
    ///
    /// Probes identically to [`NeighborTable::update`]; an empty slot
    /// proves absence because entries are never deleted.
    #[must_use]
    pub fn lookup(&self, key: K) -> Option<MacAddr> {
        let start = key.slot_index(self.capacity);
        let slots = self.slots.read();

        for step in 0..self.capacity {
            let idx = (start + step) % self.capacity;
            match &slots[idx] {
                None => return None,
                Some(entry) if entry.key == key => return Some(entry.mac),
                Some(_) => {}
            }
        }
        None
    }

    /// Seconds since `key` was last refreshed, if learned.
    #[must_use]
    pub fn age_secs(&self, key: K) -> Option<u64> {
        let start = key.slot_index(self.capacity);
        let slots = self.slots.read();

        for step in 0..self.capacity {
            let idx = (start + step) % self.capacity;
            match &slots[idx] {
                None => return None,
                Some(entry) if entry.key == key => {
                    return Some(entry.updated_at.elapsed().as_secs())
                }
                Some(_) => {}
            }
        }
        None
    }
}

impl<K: NeighborKey> std::fmt::Debug for NeighborTable<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborTable")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
