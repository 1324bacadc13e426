//! Rule file loader.
//!
//! INI-style format: one `[rule]` section per rule; `#` and `;` start
//! comments. Keys: `priority`, `ip_version` (`4`|`6`), `protocol`
//! (`tcp`|`udp`|`icmp`|`icmpv6`|0..255), `src`/`dst`
//! (`addr[/prefixlen]`, default prefix = full length), `src_port`,
//! `dst_port`, `action` (`drop`|`fwd`), `out_iface` (resolved to an
//! interface index at load time). A `fwd` rule without a resolvable
//! `out_iface` is a load error; rule problems are fatal at startup,
//! never discovered on the data path.
//!
//! The interface resolver is injected so the parser is testable without
//! real interfaces; the engine passes [`system_resolver`].

use std::ffi::CString;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use upe_core::rules::{
    ipv4_mask_from_prefix, ipv6_mask_from_prefix, Action, Rule, RuleAddrs, RuleTable,
};

/// Resolves an interface name to its index, `None` if unknown.
pub type IfaceResolver<'a> = &'a dyn Fn(&str) -> Option<u32>;

/// The production resolver: `if_nametoindex`.
pub fn system_resolver(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    // SAFETY: if_nametoindex only reads the NUL-terminated name.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    (index != 0).then_some(index)
}

/// Loads a rule table from `path`.
pub fn load_rules(path: &Path, capacity: usize, resolve: IfaceResolver) -> Result<RuleTable> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading rules file {}", path.display()))?;
    let table = parse_rules(&text, capacity, resolve)?;
    tracing::info!(rules = table.len(), file = %path.display(), "loaded rules");
    Ok(table)
}

/// One address predicate as written in the file.
#[derive(Debug, Clone, Copy)]
enum AddrPredicate {
    V4 { addr: u32, mask: u32 },
    V6 { addr: [u8; 16], mask: [u8; 16] },
}

impl AddrPredicate {
    fn ip_version(self) -> u8 {
        match self {
            Self::V4 { .. } => 4,
            Self::V6 { .. } => 6,
        }
    }
}

/// A `[rule]` section being accumulated.
#[derive(Debug, Default)]
struct PendingRule {
    priority: u32,
    ip_version: u8,
    protocol: u8,
    src: Option<AddrPredicate>,
    dst: Option<AddrPredicate>,
    src_port: u16,
    dst_port: u16,
    forward: bool,
    out_ifindex: Option<u32>,
}

impl PendingRule {
    /// Builds the final rule, reconciling IP versions across keys.
    fn build(self, line: usize) -> Result<Rule> {
        let mut version = self.ip_version;
        for predicate in [self.src, self.dst].into_iter().flatten() {
            let pv = predicate.ip_version();
            if version == 0 {
                version = pv;
            } else if version != pv {
                bail!("rules:{line}: mixed IPv4/IPv6 addresses in one rule");
            }
        }

        let addrs = match version {
            0 => RuleAddrs::Any,
            4 => {
                let (src, src_mask) = match self.src {
                    Some(AddrPredicate::V4 { addr, mask }) => (addr, mask),
                    None => (0, 0),
                    Some(AddrPredicate::V6 { .. }) => unreachable!("version reconciled above"),
                };
                let (dst, dst_mask) = match self.dst {
                    Some(AddrPredicate::V4 { addr, mask }) => (addr, mask),
                    None => (0, 0),
                    Some(AddrPredicate::V6 { .. }) => unreachable!("version reconciled above"),
                };
                RuleAddrs::V4 {
                    src,
                    src_mask,
                    dst,
                    dst_mask,
                }
            }
            _ => {
                let (src, src_mask) = match self.src {
                    Some(AddrPredicate::V6 { addr, mask }) => (addr, mask),
                    None => ([0; 16], [0; 16]),
                    Some(AddrPredicate::V4 { .. }) => unreachable!("version reconciled above"),
                };
                let (dst, dst_mask) = match self.dst {
                    Some(AddrPredicate::V6 { addr, mask }) => (addr, mask),
                    None => ([0; 16], [0; 16]),
                    Some(AddrPredicate::V4 { .. }) => unreachable!("version reconciled above"),
                };
                RuleAddrs::V6 {
                    src,
                    src_mask,
                    dst,
                    dst_mask,
                }
            }
        };

        let action = if self.forward {
            let out_ifindex = self
                .out_ifindex
                .ok_or_else(|| anyhow!("rules:{line}: fwd rule missing out_iface"))?;
            Action::Forward { out_ifindex }
        } else {
            Action::Drop
        };

        let mut rule = Rule::new(self.priority, action);
        rule.addrs = addrs;
        rule.protocol = self.protocol;
        rule.src_port = self.src_port;
        rule.dst_port = self.dst_port;
        Ok(rule)
    }
}

/// Parses rule file text into a table.
pub fn parse_rules(text: &str, capacity: usize, resolve: IfaceResolver) -> Result<RuleTable> {
    let mut table = RuleTable::with_capacity(capacity)?;
    let mut pending: Option<PendingRule> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            if let Some(rule) = pending.take() {
                table
                    .add(rule.build(line_num)?)
                    .with_context(|| format!("rules:{line_num}"))?;
            }
            if line == "[rule]" {
                pending = Some(PendingRule::default());
            } else {
                bail!("rules:{line_num}: unknown section header: {line}");
            }
            continue;
        }

        let Some(rule) = pending.as_mut() else {
            bail!("rules:{line_num}: key = value outside a [rule] section");
        };

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("rules:{line_num}: expected key = value"))?;
        let key = key.trim();
        let value = value.trim();

        match key {
            "priority" => {
                rule.priority = value
                    .parse()
                    .map_err(|_| anyhow!("rules:{line_num}: invalid priority: {value}"))?;
            }
            "ip_version" => {
                rule.ip_version = match value {
                    "4" => 4,
                    "6" => 6,
                    _ => bail!("rules:{line_num}: invalid ip_version: {value}"),
                };
            }
            "protocol" => {
                rule.protocol = parse_protocol(value)
                    .ok_or_else(|| anyhow!("rules:{line_num}: invalid protocol: {value}"))?;
            }
            "src" => {
                rule.src = Some(
                    parse_ip_prefix(value)
                        .ok_or_else(|| anyhow!("rules:{line_num}: invalid src address: {value}"))?,
                );
            }
            "dst" => {
                rule.dst = Some(
                    parse_ip_prefix(value)
                        .ok_or_else(|| anyhow!("rules:{line_num}: invalid dst address: {value}"))?,
                );
            }
            "src_port" => {
                rule.src_port = value
                    .parse()
                    .map_err(|_| anyhow!("rules:{line_num}: invalid src_port: {value}"))?;
            }
            "dst_port" => {
                rule.dst_port = value
                    .parse()
                    .map_err(|_| anyhow!("rules:{line_num}: invalid dst_port: {value}"))?;
            }
            "action" => {
                rule.forward = match value {
                    "drop" => false,
                    "fwd" => true,
                    _ => bail!("rules:{line_num}: invalid action: {value}"),
                };
            }
            "out_iface" => {
                rule.out_ifindex = Some(
                    resolve(value)
                        .ok_or_else(|| anyhow!("rules:{line_num}: unknown interface: {value}"))?,
                );
            }
            _ => bail!("rules:{line_num}: unknown key: {key}"),
        }
    }

    if let Some(rule) = pending.take() {
        let last_line = text.lines().count();
        table
            .add(rule.build(last_line)?)
            .with_context(|| format!("rules:{last_line}"))?;
    }

    Ok(table)
}

fn parse_protocol(value: &str) -> Option<u8> {
    match value {
        "tcp" => Some(6),
        "udp" => Some(17),
        "icmp" => Some(1),
        "icmpv6" => Some(58),
        other => other.parse().ok(),
    }
}

/// Parses `addr[/prefixlen]`; the default prefix is the address's full
/// length.
fn parse_ip_prefix(value: &str) -> Option<AddrPredicate> {
    let (addr_str, prefix) = match value.split_once('/') {
        Some((addr, prefix_str)) => (addr, Some(prefix_str.parse::<u8>().ok()?)),
        None => (value, None),
    };

    if let Ok(v4) = addr_str.parse::<Ipv4Addr>() {
        let mask = ipv4_mask_from_prefix(prefix.unwrap_or(32))?;
        return Some(AddrPredicate::V4 {
            addr: u32::from(v4),
            mask,
        });
    }
    if let Ok(v6) = addr_str.parse::<Ipv6Addr>() {
        let mask = ipv6_mask_from_prefix(prefix.unwrap_or(128))?;
        return Some(AddrPredicate::V6 {
            addr: v6.octets(),
            mask,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_resolver(name: &str) -> Option<u32> {
        match name {
            "eth0" => Some(2),
            "eth1" => Some(3),
            _ => None,
        }
    }

    #[test]
    fn test_load_basic_rules() {
        let text = r"
# Block SSH, forward the rest of the lab prefix.
[rule]
priority = 10
protocol = tcp
dst_port = 22
action = drop

[rule]
priority = 100
protocol = tcp
src = 10.0.0.0/8
action = fwd
out_iface = eth1

; implicit deny
[rule]
priority = 10000
action = drop
";
        let table = parse_rules(text, 16, &test_resolver).unwrap();
        assert_eq!(table.len(), 3);

        let rules: Vec<_> = table.iter().collect();
        assert_eq!(rules[0].priority, 10);
        assert_eq!(rules[0].dst_port, 22);
        assert_eq!(rules[0].action, Action::Drop);
        assert_eq!(rules[1].action, Action::Forward { out_ifindex: 3 });
        assert_eq!(
            rules[1].addrs,
            RuleAddrs::V4 {
                src: u32::from(Ipv4Addr::new(10, 0, 0, 0)),
                src_mask: 0xff00_0000,
                dst: 0,
                dst_mask: 0,
            }
        );
        assert_eq!(rules[2].priority, 10000);
        assert_eq!(rules[2].addrs, RuleAddrs::Any);
    }

    #[test]
    fn test_default_prefix_is_full_length() {
        let text = "[rule]\npriority = 1\ndst = 192.168.1.1\naction = drop\n";
        let table = parse_rules(text, 4, &test_resolver).unwrap();
        let rule = table.iter().next().unwrap();
        assert_eq!(
            rule.addrs,
            RuleAddrs::V4 {
                src: 0,
                src_mask: 0,
                dst: u32::from(Ipv4Addr::new(192, 168, 1, 1)),
                dst_mask: u32::MAX,
            }
        );
    }

    #[test]
    fn test_ipv6_rule() {
        let text = "[rule]\npriority = 5\nsrc = 2001:db8::/32\nprotocol = icmpv6\naction = drop\n";
        let table = parse_rules(text, 4, &test_resolver).unwrap();
        let rule = table.iter().next().unwrap();
        assert_eq!(rule.ip_version(), 6);
        assert_eq!(rule.protocol, 58);
    }

    #[test]
    fn test_fwd_requires_out_iface() {
        let text = "[rule]\npriority = 1\naction = fwd\n";
        let err = parse_rules(text, 4, &test_resolver).unwrap_err();
        assert!(err.to_string().contains("missing out_iface"));
    }

    #[test]
    fn test_unknown_iface_fails_load() {
        let text = "[rule]\npriority = 1\naction = fwd\nout_iface = wan7\n";
        let err = parse_rules(text, 4, &test_resolver).unwrap_err();
        assert!(err.to_string().contains("unknown interface: wan7"));
    }

    #[test]
    fn test_unknown_key_fails() {
        let text = "[rule]\nttl = 3\n";
        assert!(parse_rules(text, 4, &test_resolver).is_err());
    }

    #[test]
    fn test_key_outside_section_fails() {
        let text = "priority = 1\n";
        assert!(parse_rules(text, 4, &test_resolver).is_err());
    }

    #[test]
    fn test_mixed_versions_fail() {
        let text = "[rule]\nsrc = 10.0.0.0/8\ndst = 2001:db8::/32\naction = drop\n";
        let err = parse_rules(text, 4, &test_resolver).unwrap_err();
        assert!(err.to_string().contains("mixed IPv4/IPv6"));
    }

    #[test]
    fn test_numeric_protocol() {
        let text = "[rule]\npriority = 1\nprotocol = 47\naction = drop\n";
        let table = parse_rules(text, 4, &test_resolver).unwrap();
        assert_eq!(table.iter().next().unwrap().protocol, 47);
    }

    #[test]
    fn test_invalid_port_fails() {
        let text = "[rule]\ndst_port = 70000\naction = drop\n";
        assert!(parse_rules(text, 4, &test_resolver).is_err());
    }
}
