//! Zero-copy TCP header parser.
//!
//! TCP header layout (20-60 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          Source Port          |       Destination Port        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                        Sequence Number                       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Acknowledgment Number                     |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Data |           |U|A|P|R|S|F|                               |
//!  | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
//!  |       |           |G|K|H|T|N|N|                               |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use super::ParseError;
use serde::Serialize;
use std::fmt;

pub const TCP_MIN_HEADER_LEN: usize = 20;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// The six control flags the flow engine tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub urg: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub fn from_bits(bits: u8) -> Self {
        TcpFlags {
            syn: bits & flags::SYN != 0,
            ack: bits & flags::ACK != 0,
            fin: bits & flags::FIN != 0,
            rst: bits & flags::RST != 0,
            urg: bits & flags::URG != 0,
            psh: bits & flags::PSH != 0,
        }
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.urg, "URG"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(", "))
    }
}

#[derive(Debug)]
pub struct TcpHeader<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: TCP_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let header_len = (data[12] >> 4) as usize * 4;
        if header_len < TCP_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "TCP data offset too small: {} bytes",
                header_len
            )));
        }
        if data.len() < header_len {
            return Err(ParseError::TooShort {
                expected: header_len,
                actual: data.len(),
            });
        }

        Ok(TcpHeader { data, header_len })
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Header length in bytes, options included.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    #[inline]
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits(self.data[13])
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil;

    #[test]
    fn parse_syn_ack_with_options() {
        let mut seg = testutil::tcp(80, 49152, flags::SYN | flags::ACK, 0);
        seg[12] = 0x60; // 24-byte header
        seg.splice(20..20, [2, 4, 0x05, 0xb4]); // MSS option
        seg.extend_from_slice(b"hi");

        let hdr = TcpHeader::parse(&seg).unwrap();
        assert_eq!(hdr.src_port(), 80);
        assert_eq!(hdr.dst_port(), 49152);
        assert_eq!(hdr.header_len(), 24);
        assert_eq!(hdr.payload(), b"hi");
        let f = hdr.flags();
        assert!(f.syn && f.ack);
        assert!(!f.fin && !f.rst && !f.psh && !f.urg);
        assert_eq!(f.to_string(), "[SYN, ACK]");
    }

    #[test]
    fn all_flag_bits_map() {
        let f = TcpFlags::from_bits(0x3F);
        assert!(f.syn && f.ack && f.fin && f.rst && f.psh && f.urg);
        assert_eq!(TcpFlags::from_bits(0), TcpFlags::default());
    }

    #[test]
    fn reject_short_tcp() {
        assert!(TcpHeader::parse(&[0u8; 19]).is_err());
    }

    #[test]
    fn reject_small_data_offset() {
        let mut seg = testutil::tcp(1, 2, 0, 0);
        seg[12] = 0x40;
        assert!(TcpHeader::parse(&seg).is_err());
    }
}
