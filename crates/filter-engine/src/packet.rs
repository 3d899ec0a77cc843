//! Header view parsing.
//!
//! Extracts only what the classifier decides on: addresses, IP protocol and,
//! for TCP, the port pair. Every access is bounds-checked against the frame;
//! work is bounded (at most one VLAN tag, no IPv6 extension header walk).
//!
//! ```text
//! Ethernet II ─┬─ [802.1Q / 802.1ad tag] ─┬─ IPv4 (IHL-aware) ─┬─ TCP (20-byte min)
//! Raw IP ──────┘                          └─ IPv6 (fixed 40)  ─┘
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Ethernet
const ETH_HLEN: usize = 14;
const ETH_TYPE_OFFSET: usize = 12;
const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;
const IPV4_FRAG_MASK: u16 = 0x1FFF;

// IPv6
const IPV6_HLEN: usize = 40;
const IPV6_NEXT_HDR_OFFSET: usize = 6;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;

// TCP
const TCP_MIN_HLEN: usize = 20;

/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

/// Framing of the bytes handed to the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II, optionally with one VLAN tag
    #[default]
    Ethernet,
    /// No link header; the IP version nibble selects IPv4 or IPv6
    Raw,
}

/// Source and destination TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpPorts {
    pub src: u16,
    pub dst: u16,
}

/// The parsed fields of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderView {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IPv4 protocol / IPv6 next header
    pub protocol: u8,
    /// Present only for TCP packets that carry a TCP header
    pub tcp: Option<TcpPorts>,
}

impl HeaderView {
    /// Destination port if this is a TCP packet with a header.
    pub fn tcp_dst_port(&self) -> Option<u16> {
        self.tcp.map(|ports| ports.dst)
    }
}

/// Why a frame could not be parsed to protocol depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseFault {
    /// Frame ends before the named header is complete
    #[error("frame truncated in {layer} header")]
    Truncated { layer: &'static str },

    /// Link layer carries something other than IP
    #[error("unsupported ethertype 0x{0:04x}")]
    NotIp(u16),

    /// IP version nibble is neither 4 nor 6
    #[error("unsupported IP version {0}")]
    BadVersion(u8),

    /// IPv4 header length below the 20-byte minimum
    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(u8),
}

/// Parses `frame` far enough to decide on it.
pub fn parse(frame: &[u8], link: LinkType) -> Result<HeaderView, ParseFault> {
    match link {
        LinkType::Ethernet => parse_ethernet(frame),
        LinkType::Raw => parse_ip(frame),
    }
}

fn parse_ethernet(frame: &[u8]) -> Result<HeaderView, ParseFault> {
    let mut ethertype = read_u16(frame, ETH_TYPE_OFFSET).ok_or(ParseFault::Truncated {
        layer: "ethernet",
    })?;
    let mut l3_offset = ETH_HLEN;

    if ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        ethertype = read_u16(frame, ETH_TYPE_OFFSET + VLAN_TAG_LEN)
            .ok_or(ParseFault::Truncated { layer: "vlan" })?;
        l3_offset += VLAN_TAG_LEN;
    }

    let l3 = frame.get(l3_offset..).ok_or(ParseFault::Truncated {
        layer: "ethernet",
    })?;
    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(l3),
        ETHERTYPE_IPV6 => parse_ipv6(l3),
        other => Err(ParseFault::NotIp(other)),
    }
}

fn parse_ip(data: &[u8]) -> Result<HeaderView, ParseFault> {
    let first = *data.first().ok_or(ParseFault::Truncated { layer: "ip" })?;
    match first >> 4 {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        version => Err(ParseFault::BadVersion(version)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<HeaderView, ParseFault> {
    if data.len() < IPV4_MIN_HLEN {
        return Err(ParseFault::Truncated { layer: "ipv4" });
    }
    let version = data[0] >> 4;
    if version != 4 {
        return Err(ParseFault::BadVersion(version));
    }
    let ihl_words = data[0] & 0x0F;
    let ihl = usize::from(ihl_words) * 4;
    if ihl < IPV4_MIN_HLEN {
        return Err(ParseFault::BadHeaderLength(ihl_words));
    }
    if data.len() < ihl {
        return Err(ParseFault::Truncated { layer: "ipv4" });
    }

    let protocol = data[IPV4_PROTO_OFFSET];
    let src = IpAddr::V4(Ipv4Addr::new(
        data[IPV4_SRC_OFFSET],
        data[IPV4_SRC_OFFSET + 1],
        data[IPV4_SRC_OFFSET + 2],
        data[IPV4_SRC_OFFSET + 3],
    ));
    let dst = IpAddr::V4(Ipv4Addr::new(
        data[IPV4_DST_OFFSET],
        data[IPV4_DST_OFFSET + 1],
        data[IPV4_DST_OFFSET + 2],
        data[IPV4_DST_OFFSET + 3],
    ));

    // Non-first fragments carry no transport header.
    let flags_frag = read_u16(data, IPV4_FLAGS_FRAG_OFFSET).unwrap_or_default();
    let tcp = if protocol == PROTO_TCP && flags_frag & IPV4_FRAG_MASK == 0 {
        Some(parse_tcp(&data[ihl..])?)
    } else {
        None
    };

    Ok(HeaderView {
        src,
        dst,
        protocol,
        tcp,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<HeaderView, ParseFault> {
    if data.len() < IPV6_HLEN {
        return Err(ParseFault::Truncated { layer: "ipv6" });
    }
    let version = data[0] >> 4;
    if version != 6 {
        return Err(ParseFault::BadVersion(version));
    }

    let protocol = data[IPV6_NEXT_HDR_OFFSET];
    let src = IpAddr::V6(Ipv6Addr::from(read_16_bytes(data, IPV6_SRC_OFFSET)));
    let dst = IpAddr::V6(Ipv6Addr::from(read_16_bytes(data, IPV6_DST_OFFSET)));

    let tcp = if protocol == PROTO_TCP {
        Some(parse_tcp(&data[IPV6_HLEN..])?)
    } else {
        None
    };

    Ok(HeaderView {
        src,
        dst,
        protocol,
        tcp,
    })
}

fn parse_tcp(data: &[u8]) -> Result<TcpPorts, ParseFault> {
    if data.len() < TCP_MIN_HLEN {
        return Err(ParseFault::Truncated { layer: "tcp" });
    }
    Ok(TcpPorts {
        src: u16::from_be_bytes([data[0], data[1]]),
        dst: u16::from_be_bytes([data[2], data[3]]),
    })
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

// Callers check the 40-byte IPv6 minimum first.
fn read_16_bytes(data: &[u8], offset: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&data[offset..offset + 16]);
    out
}

/// Frame builders shared by unit tests, integration tests and benches.
#[doc(hidden)]
pub mod testing {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::PROTO_TCP;

    /// Ethernet II + IPv4 (IHL 5) + 20-byte TCP header.
    pub fn tcp_ipv4_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
        ipv4_frame(
            PROTO_TCP,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &tcp_header(src_port, dst_port),
        )
    }

    /// Ethernet II + IPv4 (IHL 5) + 8-byte UDP header.
    pub fn udp_ipv4_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut udp = Vec::with_capacity(8);
        udp.extend_from_slice(&src_port.to_be_bytes());
        udp.extend_from_slice(&dst_port.to_be_bytes());
        udp.extend_from_slice(&[0, 8, 0, 0]);
        ipv4_frame(
            17,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            &udp,
        )
    }

    /// Ethernet II + IPv6 + 20-byte TCP header.
    pub fn tcp_ipv6_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut frame = ethernet_header(0x86DD);
        let payload = tcp_header(src_port, dst_port);
        frame.extend_from_slice(&[0x60, 0, 0, 0]);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.push(PROTO_TCP);
        frame.push(64);
        frame.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        frame.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Ethernet II + IPv4 with a custom protocol and payload.
    pub fn ipv4_frame(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut frame = ethernet_header(0x0800);
        frame.extend_from_slice(&ipv4_header(protocol, src, dst, payload.len()));
        frame.extend_from_slice(payload);
        frame
    }

    /// 20-byte IPv4 header without options.
    pub fn ipv4_header(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
        let total_len = (20 + payload_len) as u16;
        let mut header = vec![0x45, 0];
        header.extend_from_slice(&total_len.to_be_bytes());
        header.extend_from_slice(&[0, 0, 0x40, 0]); // id, DF
        header.push(64);
        header.push(protocol);
        header.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&src.octets());
        header.extend_from_slice(&dst.octets());
        header
    }

    /// 20-byte TCP header with SYN set.
    pub fn tcp_header(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut header = Vec::with_capacity(20);
        header.extend_from_slice(&src_port.to_be_bytes());
        header.extend_from_slice(&dst_port.to_be_bytes());
        header.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
        header.extend_from_slice(&[0x50, 0x02, 0xFF, 0xFF, 0, 0, 0, 0]);
        header
    }

    fn ethernet_header(ethertype: u16) -> Vec<u8> {
        let mut header = vec![0u8; 12];
        header.extend_from_slice(&ethertype.to_be_bytes());
        header
    }
}
