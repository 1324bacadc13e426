//! Zero-copy flow-key extraction.
//!
//! Classifies an Ethernet-framed packet into a 5-tuple [`FlowKey`] without
//! copying the frame. Anything the ruleset cannot express (non-IP
//! EtherTypes, unknown transports, truncated headers) is "not
//! classifiable" and reported as a [`ParseError`]: a data-plane event,
//! not a fault.

use super::headers::{
    self as hdr, eth, icmp, ipv4, ipv6, read_addr16, read_u16_be, read_u32_be, tcp, udp,
};

/// Why a frame could not be classified.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Frame shorter than an Ethernet header.
    #[error("frame too short for an Ethernet header")]
    TruncatedEthernet,

    /// EtherType this engine does not classify (including ARP, which is
    /// consumed by the control-plane snoop instead).
    #[error("ethertype {0:#06x} is not classifiable")]
    UnsupportedEtherType(u16),

    /// IPv4 header truncated, wrong version, or bad IHL.
    #[error("truncated or malformed IPv4 header")]
    BadIpv4Header,

    /// IPv6 header truncated.
    #[error("truncated IPv6 header")]
    TruncatedIpv6,

    /// IP protocol this engine does not classify.
    #[error("ip protocol {0} is not classifiable")]
    UnsupportedProtocol(u8),

    /// Transport header truncated or malformed.
    #[error("truncated or malformed transport header")]
    BadTransportHeader,
}

/// Source and destination addresses of a flow, by IP version.
///
/// IPv4 addresses are host-order `u32`s; IPv6 addresses are raw 16-byte
/// arrays in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowAddrs {
    /// IPv4 endpoints.
    V4 {
        /// Source address, host order.
        src: u32,
        /// Destination address, host order.
        dst: u32,
    },
    /// IPv6 endpoints.
    V6 {
        /// Source address, wire order.
        src: [u8; 16],
        /// Destination address, wire order.
        dst: [u8; 16],
    },
}

/// A classified 5-tuple.
///
/// For ICMP/ICMPv6 the port fields are repurposed: `src_port` carries the
/// 16-bit identifier and `dst_port` carries `(type << 8) | code`, so
/// ICMP flows hash and match like everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Flow endpoints.
    pub addrs: FlowAddrs,
    /// Source port (or ICMP identifier).
    pub src_port: u16,
    /// Destination port (or ICMP `(type << 8) | code`).
    pub dst_port: u16,
    /// IP protocol number.
    pub protocol: u8,
}

impl FlowKey {
    /// IP version of this flow: 4 or 6.
    #[must_use]
    pub fn ip_version(&self) -> u8 {
        match self.addrs {
            FlowAddrs::V4 { .. } => 4,
            FlowAddrs::V6 { .. } => 6,
        }
    }

    /// The reverse-direction key (src and dst swapped).
    #[must_use]
    pub fn reversed(&self) -> Self {
        let addrs = match self.addrs {
            FlowAddrs::V4 { src, dst } => FlowAddrs::V4 { src: dst, dst: src },
            FlowAddrs::V6 { src, dst } => FlowAddrs::V6 { src: dst, dst: src },
        };
        Self {
            addrs,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

/// Extracts the flow key from an Ethernet frame.
///
/// Dispatches on EtherType (IPv4/IPv6 only), then on the IP next-protocol
/// (TCP, UDP, ICMP, ICMPv6 only). All reads are byte-wise; the frame may
/// sit at any buffer offset.
///
/// # Errors
///
/// Returns a [`ParseError`] naming the first check that failed.
pub fn parse_flow_key(frame: &[u8]) -> Result<FlowKey, ParseError> {
    if frame.len() < eth::LEN {
        return Err(ParseError::TruncatedEthernet);
    }

    let ethertype = read_u16_be(frame, eth::ETHERTYPE);
    let ip = &frame[eth::LEN..];

    match ethertype {
        hdr::ETHERTYPE_IPV4 => parse_ipv4(ip),
        hdr::ETHERTYPE_IPV6 => parse_ipv6(ip),
        other => Err(ParseError::UnsupportedEtherType(other)),
    }
}

fn parse_ipv4(ip: &[u8]) -> Result<FlowKey, ParseError> {
    if ip.len() < ipv4::MIN_LEN {
        return Err(ParseError::BadIpv4Header);
    }

    let ver_ihl = ip[ipv4::VER_IHL];
    let version = ver_ihl >> 4;
    let header_len = usize::from(ver_ihl & 0x0f) * 4;
    if version != 4 || header_len < ipv4::MIN_LEN || ip.len() < header_len {
        return Err(ParseError::BadIpv4Header);
    }

    let addrs = FlowAddrs::V4 {
        src: read_u32_be(ip, ipv4::SRC),
        dst: read_u32_be(ip, ipv4::DST),
    };
    let protocol = ip[ipv4::PROTOCOL];

    let (src_port, dst_port) = parse_transport(&ip[header_len..], protocol)?;
    Ok(FlowKey {
        addrs,
        src_port,
        dst_port,
        protocol,
    })
}

fn parse_ipv6(ip: &[u8]) -> Result<FlowKey, ParseError> {
    if ip.len() < ipv6::LEN {
        return Err(ParseError::TruncatedIpv6);
    }

    let addrs = FlowAddrs::V6 {
        src: read_addr16(ip, ipv6::SRC),
        dst: read_addr16(ip, ipv6::DST),
    };
    let protocol = ip[ipv6::NEXT_HEADER];

    let (src_port, dst_port) = parse_transport(&ip[ipv6::LEN..], protocol)?;
    Ok(FlowKey {
        addrs,
        src_port,
        dst_port,
        protocol,
    })
}

/// Extracts the port pair from the transport header.
fn parse_transport(l4: &[u8], protocol: u8) -> Result<(u16, u16), ParseError> {
    match protocol {
        hdr::IPPROTO_UDP => {
            if l4.len() < udp::LEN {
                return Err(ParseError::BadTransportHeader);
            }
            Ok((
                read_u16_be(l4, udp::SRC_PORT),
                read_u16_be(l4, udp::DST_PORT),
            ))
        }
        hdr::IPPROTO_TCP => {
            if l4.len() < tcp::MIN_LEN {
                return Err(ParseError::BadTransportHeader);
            }
            let header_len = usize::from(l4[tcp::DATA_OFFSET] >> 4) * 4;
            if header_len < tcp::MIN_LEN || l4.len() < header_len {
                return Err(ParseError::BadTransportHeader);
            }
            Ok((
                read_u16_be(l4, tcp::SRC_PORT),
                read_u16_be(l4, tcp::DST_PORT),
            ))
        }
        hdr::IPPROTO_ICMP | hdr::IPPROTO_ICMPV6 => {
            if l4.len() < icmp::LEN {
                return Err(ParseError::BadTransportHeader);
            }
            // Identifier stands in for the source port; type/code pack
            // into the destination port.
            let ident = read_u16_be(l4, icmp::IDENT);
            let type_code = (u16::from(l4[icmp::TYPE]) << 8) | u16::from(l4[icmp::CODE]);
            Ok((ident, type_code))
        }
        other => Err(ParseError::UnsupportedProtocol(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ethernet + IPv4 + TCP frame with the given endpoints.
    fn tcp4_frame(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        ttl: u8,
    ) -> Vec<u8> {
        let mut f = vec![0u8; eth::LEN + ipv4::MIN_LEN + tcp::MIN_LEN];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_IPV4.to_be_bytes());
        let ip = eth::LEN;
        f[ip + ipv4::VER_IHL] = 0x45;
        f[ip + ipv4::TTL] = ttl;
        f[ip + ipv4::PROTOCOL] = hdr::IPPROTO_TCP;
        f[ip + ipv4::SRC..ip + ipv4::SRC + 4].copy_from_slice(&src);
        f[ip + ipv4::DST..ip + ipv4::DST + 4].copy_from_slice(&dst);
        let l4 = ip + ipv4::MIN_LEN;
        f[l4 + tcp::SRC_PORT..l4 + tcp::SRC_PORT + 2].copy_from_slice(&src_port.to_be_bytes());
        f[l4 + tcp::DST_PORT..l4 + tcp::DST_PORT + 2].copy_from_slice(&dst_port.to_be_bytes());
        f[l4 + tcp::DATA_OFFSET] = 5 << 4;
        f
    }

    fn udp6_frame(src: [u8; 16], dst: [u8; 16], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut f = vec![0u8; eth::LEN + ipv6::LEN + udp::LEN];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_IPV6.to_be_bytes());
        let ip = eth::LEN;
        f[ip] = 0x60;
        f[ip + ipv6::NEXT_HEADER] = hdr::IPPROTO_UDP;
        f[ip + ipv6::HOP_LIMIT] = 64;
        f[ip + ipv6::SRC..ip + ipv6::SRC + 16].copy_from_slice(&src);
        f[ip + ipv6::DST..ip + ipv6::DST + 16].copy_from_slice(&dst);
        let l4 = ip + ipv6::LEN;
        f[l4..l4 + 2].copy_from_slice(&src_port.to_be_bytes());
        f[l4 + 2..l4 + 4].copy_from_slice(&dst_port.to_be_bytes());
        f
    }

    #[test]
    fn test_rejects_short_ethernet() {
        assert_eq!(
            parse_flow_key(&[0u8; 12]),
            Err(ParseError::TruncatedEthernet)
        );
    }

    #[test]
    fn test_rejects_truncated_ip() {
        let mut f = vec![0u8; eth::LEN + 3];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_IPV4.to_be_bytes());
        assert_eq!(parse_flow_key(&f), Err(ParseError::BadIpv4Header));
    }

    #[test]
    fn test_rejects_truncated_tcp() {
        let full = tcp4_frame([10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000, 64);
        let truncated = &full[..eth::LEN + ipv4::MIN_LEN + 3];
        assert_eq!(
            parse_flow_key(truncated),
            Err(ParseError::BadTransportHeader)
        );
    }

    #[test]
    fn test_rejects_arp_ethertype() {
        let mut f = vec![0u8; 64];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_ARP.to_be_bytes());
        assert_eq!(
            parse_flow_key(&f),
            Err(ParseError::UnsupportedEtherType(hdr::ETHERTYPE_ARP))
        );
    }

    #[test]
    fn test_rejects_bad_ihl() {
        let mut f = tcp4_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 64);
        f[eth::LEN + ipv4::VER_IHL] = 0x44; // IHL 4 => 16-byte header
        assert_eq!(parse_flow_key(&f), Err(ParseError::BadIpv4Header));
    }

    #[test]
    fn test_parses_tcp4() {
        let f = tcp4_frame([10, 0, 0, 1], [192, 168, 0, 7], 4321, 22, 64);
        let key = parse_flow_key(&f).unwrap();

        assert_eq!(key.ip_version(), 4);
        assert_eq!(
            key.addrs,
            FlowAddrs::V4 {
                src: u32::from_be_bytes([10, 0, 0, 1]),
                dst: u32::from_be_bytes([192, 168, 0, 7]),
            }
        );
        assert_eq!(key.src_port, 4321);
        assert_eq!(key.dst_port, 22);
        assert_eq!(key.protocol, hdr::IPPROTO_TCP);
    }

    #[test]
    fn test_parses_udp6() {
        let mut src = [0u8; 16];
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[15] = 2;
        let f = udp6_frame(src, dst, 5353, 53);
        let key = parse_flow_key(&f).unwrap();

        assert_eq!(key.ip_version(), 6);
        assert_eq!(key.addrs, FlowAddrs::V6 { src, dst });
        assert_eq!((key.src_port, key.dst_port), (5353, 53));
        assert_eq!(key.protocol, hdr::IPPROTO_UDP);
    }

    #[test]
    fn test_parses_at_odd_offset() {
        // The frame body must parse identically when it starts at an odd
        // address: place it at offset 1 of a larger buffer.
        let mut src = [0u8; 16];
        src[0] = 0xfe;
        let dst = [0x20; 16];
        let frame = udp6_frame(src, dst, 7, 8);

        let mut shifted = vec![0u8; frame.len() + 1];
        shifted[1..].copy_from_slice(&frame);

        let key = parse_flow_key(&shifted[1..]).unwrap();
        assert_eq!(key.addrs, FlowAddrs::V6 { src, dst });
    }

    #[test]
    fn test_icmp_port_mapping() {
        // ICMPv4 echo request, id 0x1234, type 8, code 0.
        let mut f = vec![0u8; eth::LEN + ipv4::MIN_LEN + icmp::LEN];
        f[eth::ETHERTYPE..eth::LEN].copy_from_slice(&hdr::ETHERTYPE_IPV4.to_be_bytes());
        let ip = eth::LEN;
        f[ip + ipv4::VER_IHL] = 0x45;
        f[ip + ipv4::PROTOCOL] = hdr::IPPROTO_ICMP;
        let l4 = ip + ipv4::MIN_LEN;
        f[l4 + icmp::TYPE] = 8;
        f[l4 + icmp::CODE] = 0;
        f[l4 + icmp::IDENT..l4 + icmp::IDENT + 2].copy_from_slice(&0x1234u16.to_be_bytes());

        let key = parse_flow_key(&f).unwrap();
        assert_eq!(key.src_port, 0x1234);
        assert_eq!(key.dst_port, 0x0800);
    }

    #[test]
    fn test_reversed_swaps_both() {
        let key = parse_flow_key(&tcp4_frame([1, 2, 3, 4], [5, 6, 7, 8], 10, 20, 64)).unwrap();
        let rev = key.reversed();
        assert_eq!(
            rev.addrs,
            FlowAddrs::V4 {
                src: u32::from_be_bytes([5, 6, 7, 8]),
                dst: u32::from_be_bytes([1, 2, 3, 4]),
            }
        );
        assert_eq!((rev.src_port, rev.dst_port), (20, 10));
        assert_eq!(rev.reversed(), key);
    }
}
