//! # Rule Table
//!
//! Priority-ordered wildcard classification over 5-tuples.
//!
//! Rules are loaded once at startup, sorted by `(priority, insertion
//! order)`, and frozen. Workers then scan the table without any
//! synchronization: lookup walks the sorted vector and returns the first
//! rule whose predicates all match, which by construction is the
//! highest-priority match. Dynamic updates would require a copy-on-swap
//! discipline; this table does not support them.

use crate::packet::parser::{FlowAddrs, FlowKey};

/// Errors from rule table construction.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RuleError {
    /// The requested capacity is zero.
    #[error("rule table capacity must be > 0")]
    ZeroCapacity,

    /// The table is full.
    #[error("rule table is full (capacity {0})")]
    Full(usize),
}

/// What to do with a matched packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Drop the packet.
    Drop,
    /// Forward the packet out of the interface with this index.
    Forward {
        /// Egress interface index.
        out_ifindex: u32,
    },
}

/// Address predicates of a rule, by IP version.
///
/// A mask of all zeros wildcards the corresponding address; [`RuleAddrs::Any`]
/// additionally wildcards the IP version itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAddrs {
    /// Match any IP version and any address.
    Any,
    /// IPv4 prefixes (host-order addresses and masks).
    V4 {
        /// Source address.
        src: u32,
        /// Source mask (0 = wildcard).
        src_mask: u32,
        /// Destination address.
        dst: u32,
        /// Destination mask (0 = wildcard).
        dst_mask: u32,
    },
    /// IPv6 prefixes (wire-order addresses and masks).
    V6 {
        /// Source address.
        src: [u8; 16],
        /// Source mask (all-zero = wildcard).
        src_mask: [u8; 16],
        /// Destination address.
        dst: [u8; 16],
        /// Destination mask (all-zero = wildcard).
        dst_mask: [u8; 16],
    },
}

/// One classification rule.
///
/// Zero-valued ports and protocol are wildcards. `rule_id` is assigned by
/// the table in insertion order and indexes the per-worker rule stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    /// Priority; lower wins.
    pub priority: u32,
    /// Address predicates.
    pub addrs: RuleAddrs,
    /// Source port predicate (0 = any).
    pub src_port: u16,
    /// Destination port predicate (0 = any).
    pub dst_port: u16,
    /// Protocol predicate (0 = any).
    pub protocol: u8,
    /// Action on match.
    pub action: Action,
    rule_id: u32,
}

impl Rule {
    /// A rule matching everything, with the given priority and action.
    /// Narrow it by assigning the predicate fields.
    #[must_use]
    pub fn new(priority: u32, action: Action) -> Self {
        Self {
            priority,
            addrs: RuleAddrs::Any,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            action,
            rule_id: 0,
        }
    }

    /// Stable identifier assigned at insertion; indexes rule stats.
    #[must_use]
    pub fn rule_id(&self) -> u32 {
        self.rule_id
    }

    /// IP version this rule applies to: 0 (any), 4, or 6.
    #[must_use]
    pub fn ip_version(&self) -> u8 {
        match self.addrs {
            RuleAddrs::Any => 0,
            RuleAddrs::V4 { .. } => 4,
            RuleAddrs::V6 { .. } => 6,
        }
    }

    /// Whether every predicate of this rule matches `key`.
    ///
    /// Cheap scalar checks run before the address masking.
    #[must_use]
    pub fn matches(&self, key: &FlowKey) -> bool {
        if self.protocol != 0 && self.protocol != key.protocol {
            return false;
        }
        if self.src_port != 0 && self.src_port != key.src_port {
            return false;
        }
        if self.dst_port != 0 && self.dst_port != key.dst_port {
            return false;
        }

        match (&self.addrs, &key.addrs) {
            (RuleAddrs::Any, _) => true,
            (
                RuleAddrs::V4 {
                    src,
                    src_mask,
                    dst,
                    dst_mask,
                },
                FlowAddrs::V4 {
                    src: key_src,
                    dst: key_dst,
                },
            ) => (key_src & src_mask) == (src & src_mask) && (key_dst & dst_mask) == (dst & dst_mask),
            (
                RuleAddrs::V6 {
                    src,
                    src_mask,
                    dst,
                    dst_mask,
                },
                FlowAddrs::V6 {
                    src: key_src,
                    dst: key_dst,
                },
            ) => masked_eq16(key_src, src, src_mask) && masked_eq16(key_dst, dst, dst_mask),
            // IP version mismatch.
            _ => false,
        }
    }

    /// Zeroes address fields whose mask is a full wildcard, so equal rules
    /// compare equal regardless of how they were written.
    fn normalize(&mut self) {
        match &mut self.addrs {
            RuleAddrs::Any => {}
            RuleAddrs::V4 {
                src,
                src_mask,
                dst,
                dst_mask,
            } => {
                if *src_mask == 0 {
                    *src = 0;
                }
                if *dst_mask == 0 {
                    *dst = 0;
                }
            }
            RuleAddrs::V6 {
                src,
                src_mask,
                dst,
                dst_mask,
            } => {
                if *src_mask == [0; 16] {
                    *src = [0; 16];
                }
                if *dst_mask == [0; 16] {
                    *dst = [0; 16];
                }
            }
        }
    }
}

fn masked_eq16(a: &[u8; 16], b: &[u8; 16], mask: &[u8; 16]) -> bool {
    a.iter()
        .zip(b)
        .zip(mask)
        .all(|((x, y), m)| (x & m) == (y & m))
}

/// Builds a host-order IPv4 mask from a prefix length.
///
/// Returns `None` for prefixes above 32.
#[must_use]
pub fn ipv4_mask_from_prefix(prefix_len: u8) -> Option<u32> {
    match prefix_len {
        0 => Some(0),
        1..=31 => Some(u32::MAX << (32 - prefix_len)),
        32 => Some(u32::MAX),
        _ => None,
    }
}

/// Builds an IPv6 mask from a prefix length.
///
/// Returns `None` for prefixes above 128.
#[must_use]
pub fn ipv6_mask_from_prefix(prefix_len: u8) -> Option<[u8; 16]> {
    if prefix_len > 128 {
        return None;
    }
    let mut mask = [0u8; 16];
    let full_bytes = usize::from(prefix_len / 8);
    for byte in &mut mask[..full_bytes] {
        *byte = 0xff;
    }
    let remaining = prefix_len % 8;
    if remaining > 0 {
        mask[full_bytes] = 0xff << (8 - remaining);
    }
    Some(mask)
}

/// Priority-sorted rule table, frozen after load.
#[derive(Debug)]
pub struct RuleTable {
    rules: Vec<Rule>,
    capacity: usize,
}

impl RuleTable {
    /// Creates an empty table with room for `capacity` rules.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::ZeroCapacity`] for capacity 0.
    pub fn with_capacity(capacity: usize) -> Result<Self, RuleError> {
        if capacity == 0 {
            return Err(RuleError::ZeroCapacity);
        }
        Ok(Self {
            rules: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// Adds a rule, assigning its `rule_id` in insertion order and
    /// re-sorting by `(priority, rule_id)`.
    ///
    /// The re-sort per insert is O(n log n), which is irrelevant at load
    /// time and buys an unconditionally sorted table for lookup.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Full`] when the table is at capacity.
    pub fn add(&mut self, mut rule: Rule) -> Result<u32, RuleError> {
        if self.rules.len() >= self.capacity {
            return Err(RuleError::Full(self.capacity));
        }

        #[allow(clippy::cast_possible_truncation)] // capacity bounds the count
        let rule_id = self.rules.len() as u32;
        rule.rule_id = rule_id;
        rule.normalize();
        self.rules.push(rule);
        self.rules.sort_by_key(|r| (r.priority, r.rule_id));
        Ok(rule_id)
    }

    /// Returns the first (highest-priority) rule matching `key`.
    ///
    /// Linear scan over the sorted table: O(rules) worst case, first-entry
    /// hit in the common case of a hot rule near the top. Safe to call
    /// from any number of threads once loading is done.
    #[must_use]
    pub fn lookup(&self, key: &FlowKey) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(key))
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Capacity fixed at construction; also sizes the per-worker rule
    /// stats arrays.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates rules in match order (priority ascending).
    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }
}

impl<'a> IntoIterator for &'a RuleTable {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp4_key(src: u32, dst: u32, src_port: u16, dst_port: u16) -> FlowKey {
        FlowKey {
            addrs: FlowAddrs::V4 { src, dst },
            src_port,
            dst_port,
            protocol: 6,
        }
    }

    #[test]
    fn test_priority_ordering() {
        let mut table = RuleTable::with_capacity(8).unwrap();
        table.add(Rule::new(100, Action::Drop)).unwrap();
        table.add(Rule::new(10, Action::Drop)).unwrap();
        table.add(Rule::new(66, Action::Drop)).unwrap();

        let priorities: Vec<u32> = table.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![10, 66, 100]);
    }

    #[test]
    fn test_equal_priority_keeps_insertion_order() {
        let mut table = RuleTable::with_capacity(8).unwrap();
        let first = table.add(Rule::new(50, Action::Drop)).unwrap();
        let second = table
            .add(Rule::new(50, Action::Forward { out_ifindex: 1 }))
            .unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);

        let ids: Vec<u32> = table.iter().map(Rule::rule_id).collect();
        assert_eq!(ids, vec![0, 1]);
        // The earlier insertion wins the tie.
        let key = tcp4_key(1, 2, 3, 4);
        assert_eq!(table.lookup(&key).unwrap().action, Action::Drop);
    }

    #[test]
    fn test_full_wildcard_matches_everything() {
        let mut table = RuleTable::with_capacity(4).unwrap();
        table.add(Rule::new(1, Action::Drop)).unwrap();

        assert!(table.lookup(&tcp4_key(0x0a00_0001, 0xffff_ffff, 0, 65535)).is_some());
        let v6 = FlowKey {
            addrs: FlowAddrs::V6 {
                src: [1; 16],
                dst: [2; 16],
            },
            src_port: 1,
            dst_port: 2,
            protocol: 17,
        };
        assert!(table.lookup(&v6).is_some());
    }

    #[test]
    fn test_version_scoped_wildcard() {
        // Wildcard addresses but pinned to IPv4: must not match IPv6 keys.
        let mut table = RuleTable::with_capacity(4).unwrap();
        let mut rule = Rule::new(1, Action::Drop);
        rule.addrs = RuleAddrs::V4 {
            src: 0,
            src_mask: 0,
            dst: 0,
            dst_mask: 0,
        };
        table.add(rule).unwrap();

        assert!(table.lookup(&tcp4_key(123, 456, 7, 8)).is_some());
        let v6 = FlowKey {
            addrs: FlowAddrs::V6 {
                src: [0; 16],
                dst: [0; 16],
            },
            src_port: 7,
            dst_port: 8,
            protocol: 6,
        };
        assert!(table.lookup(&v6).is_none());
    }

    #[test]
    fn test_prefix_matching_v4() {
        let mut table = RuleTable::with_capacity(4).unwrap();
        let mut rule = Rule::new(10, Action::Forward { out_ifindex: 3 });
        rule.addrs = RuleAddrs::V4 {
            src: u32::from_be_bytes([10, 0, 0, 0]),
            src_mask: ipv4_mask_from_prefix(8).unwrap(),
            dst: 0,
            dst_mask: 0,
        };
        rule.protocol = 6;
        table.add(rule).unwrap();

        let inside = tcp4_key(u32::from_be_bytes([10, 9, 8, 7]), 1, 2, 3);
        let outside = tcp4_key(u32::from_be_bytes([11, 0, 0, 1]), 1, 2, 3);
        assert!(table.lookup(&inside).is_some());
        assert!(table.lookup(&outside).is_none());
    }

    #[test]
    fn test_prefix_matching_v6() {
        let mut table = RuleTable::with_capacity(4).unwrap();
        let mut prefix = [0u8; 16];
        prefix[0] = 0x20;
        prefix[1] = 0x01;
        let mut rule = Rule::new(10, Action::Drop);
        rule.addrs = RuleAddrs::V6 {
            src: [0; 16],
            src_mask: [0; 16],
            dst: prefix,
            dst_mask: ipv6_mask_from_prefix(16).unwrap(),
        };
        table.add(rule).unwrap();

        let mut inside_dst = prefix;
        inside_dst[15] = 0x42;
        let inside = FlowKey {
            addrs: FlowAddrs::V6 {
                src: [9; 16],
                dst: inside_dst,
            },
            src_port: 0,
            dst_port: 0,
            protocol: 17,
        };
        let mut outside_dst = prefix;
        outside_dst[1] = 0x02;
        let outside = FlowKey {
            addrs: FlowAddrs::V6 {
                src: [9; 16],
                dst: outside_dst,
            },
            ..inside
        };
        assert!(table.lookup(&inside).is_some());
        assert!(table.lookup(&outside).is_none());
    }

    #[test]
    fn test_port_and_protocol_predicates() {
        let mut table = RuleTable::with_capacity(4).unwrap();
        let mut rule = Rule::new(10, Action::Drop);
        rule.protocol = 6;
        rule.dst_port = 22;
        table.add(rule).unwrap();

        assert!(table.lookup(&tcp4_key(1, 2, 40000, 22)).is_some());
        assert!(table.lookup(&tcp4_key(1, 2, 40000, 23)).is_none());
        let udp = FlowKey {
            protocol: 17,
            ..tcp4_key(1, 2, 40000, 22)
        };
        assert!(table.lookup(&udp).is_none());
    }

    #[test]
    fn test_normalization_zeroes_wildcard_addrs() {
        let mut table = RuleTable::with_capacity(4).unwrap();
        let mut rule = Rule::new(1, Action::Drop);
        rule.addrs = RuleAddrs::V4 {
            src: 0xdead_beef,
            src_mask: 0,
            dst: 0,
            dst_mask: 0,
        };
        table.add(rule).unwrap();

        let stored = table.iter().next().unwrap();
        assert_eq!(
            stored.addrs,
            RuleAddrs::V4 {
                src: 0,
                src_mask: 0,
                dst: 0,
                dst_mask: 0
            }
        );
    }

    #[test]
    fn test_capacity_enforced() {
        let mut table = RuleTable::with_capacity(1).unwrap();
        table.add(Rule::new(1, Action::Drop)).unwrap();
        assert_eq!(
            table.add(Rule::new(2, Action::Drop)).unwrap_err(),
            RuleError::Full(1)
        );
    }

    #[test]
    fn test_mask_from_prefix() {
        assert_eq!(ipv4_mask_from_prefix(0), Some(0));
        assert_eq!(ipv4_mask_from_prefix(8), Some(0xff00_0000));
        assert_eq!(ipv4_mask_from_prefix(17), Some(0xffff_8000));
        assert_eq!(ipv4_mask_from_prefix(32), Some(u32::MAX));
        assert_eq!(ipv4_mask_from_prefix(33), None);

        assert_eq!(ipv6_mask_from_prefix(0), Some([0; 16]));
        let m64 = ipv6_mask_from_prefix(64).unwrap();
        assert_eq!(&m64[..8], &[0xff; 8]);
        assert_eq!(&m64[8..], &[0; 8]);
        let m17 = ipv6_mask_from_prefix(17).unwrap();
        assert_eq!(m17[2], 0x80);
        assert_eq!(ipv6_mask_from_prefix(129), None);
    }
}
