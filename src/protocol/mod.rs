//! Zero-copy header decoding for captured frames.
//!
//! Only the layers the flow engine consumes are decoded: a link layer
//! (Ethernet, Linux cooked capture or raw IP), IPv4, and TCP/UDP.

pub mod ethernet;
pub mod ipv4;
pub mod sll;
pub mod tcp;
pub mod udp;

use std::fmt;

/// EtherType values the decoder recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Arp,
    VlanTagged,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x0806 => EtherType::Arp,
            0x8100 => EtherType::VlanTagged,
            other => EtherType::Unknown(other),
        }
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::Ipv4 => write!(f, "IPv4"),
            EtherType::Ipv6 => write!(f, "IPv6"),
            EtherType::Arp => write!(f, "ARP"),
            EtherType::VlanTagged => write!(f, "802.1Q VLAN"),
            EtherType::Unknown(v) => write!(f, "Unknown(0x{:04x})", v),
        }
    }
}

/// IP protocol numbers relevant to flow tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Other(v) => write!(f, "Proto({})", v),
        }
    }
}

/// Link-layer framing of a capture, derived from its pcap link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    RawIp,
}

impl LinkType {
    /// Map a pcap DLT / LINKTYPE value. Returns `None` for framings we
    /// cannot decode.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkType::Ethernet),
            113 => Some(LinkType::LinuxSll),
            12 | 101 | 228 => Some(LinkType::RawIp),
            _ => None,
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Ethernet => write!(f, "ethernet"),
            LinkType::LinuxSll => write!(f, "linux-sll"),
            LinkType::RawIp => write!(f, "raw-ip"),
        }
    }
}

/// Errors from header decoding.
#[derive(Debug)]
pub enum ParseError {
    /// Not enough bytes to hold the header.
    TooShort { expected: usize, actual: usize },
    /// Header fields are inconsistent.
    InvalidHeader(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "packet too short: need {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Transport layer header.
#[derive(Debug)]
pub enum TransportHeader<'a> {
    Tcp(tcp::TcpHeader<'a>),
    Udp(udp::UdpHeader<'a>),
}

/// A decoded frame borrowing from the capture buffer.
///
/// `network` is `None` for non-IPv4 traffic; `transport` is `None` when the
/// IP payload is neither TCP nor UDP, is a non-first fragment, or failed to
/// decode.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub link: LinkType,
    /// EtherType of the network layer, after any VLAN tag.
    pub ether_type: EtherType,
    pub network: Option<ipv4::Ipv4Header<'a>>,
    pub transport: Option<TransportHeader<'a>>,
}

/// Decode a captured frame according to the capture's link type.
pub fn parse_frame(link: LinkType, data: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    let (ether_type, l3) = match link {
        LinkType::Ethernet => {
            let eth = ethernet::EthernetHeader::parse(data)?;
            strip_vlan(eth.ether_type(), eth.payload())?
        }
        LinkType::LinuxSll => {
            let sll = sll::SllHeader::parse(data)?;
            strip_vlan(sll.protocol(), sll.payload())?
        }
        LinkType::RawIp => {
            // Raw captures carry no EtherType; the IP version nibble decides.
            let ether_type = match data.first().map(|b| b >> 4) {
                Some(4) => EtherType::Ipv4,
                Some(6) => EtherType::Ipv6,
                Some(_) => EtherType::Unknown(0),
                None => {
                    return Err(ParseError::TooShort {
                        expected: 1,
                        actual: 0,
                    })
                }
            };
            (ether_type, data)
        }
    };

    if ether_type != EtherType::Ipv4 {
        return Ok(ParsedPacket {
            link,
            ether_type,
            network: None,
            transport: None,
        });
    }

    let ip = ipv4::Ipv4Header::parse(l3)?;
    let transport = if ip.fragment_offset() != 0 {
        None
    } else {
        match ip.protocol() {
            IpProtocol::Tcp => tcp::TcpHeader::parse(ip.payload())
                .ok()
                .map(TransportHeader::Tcp),
            IpProtocol::Udp => udp::UdpHeader::parse(ip.payload())
                .ok()
                .map(TransportHeader::Udp),
            IpProtocol::Other(_) => None,
        }
    };

    Ok(ParsedPacket {
        link,
        ether_type,
        network: Some(ip),
        transport,
    })
}

fn strip_vlan(
    ether_type: EtherType,
    payload: &[u8],
) -> Result<(EtherType, &[u8]), ParseError> {
    if ether_type != EtherType::VlanTagged {
        return Ok((ether_type, payload));
    }
    if payload.len() < 4 {
        return Err(ParseError::TooShort {
            expected: 4,
            actual: payload.len(),
        });
    }
    // Bytes 0..2 are the tag control info (priority, VLAN id).
    let inner = EtherType::from(u16::from_be_bytes([payload[2], payload[3]]));
    Ok((inner, &payload[4..]))
}
