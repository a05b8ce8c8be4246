//! Linux "cooked" capture v1 header (DLT_LINUX_SLL), as written by
//! `tcpdump -i any`.
//!
//! Layout (16 bytes): packet type (2), ARPHRD type (2), link-layer address
//! length (2), link-layer address (8), protocol / EtherType (2).

use super::{EtherType, ParseError};

pub const SLL_HEADER_LEN: usize = 16;

#[derive(Debug)]
pub struct SllHeader<'a> {
    data: &'a [u8],
}

impl<'a> SllHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() < SLL_HEADER_LEN {
            return Err(ParseError::TooShort {
                expected: SLL_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(SllHeader { data })
    }

    #[inline]
    pub fn protocol(&self) -> EtherType {
        EtherType::from(u16::from_be_bytes([self.data[14], self.data[15]]))
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[SLL_HEADER_LEN..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_protocol_and_payload() {
        let mut frame = vec![0u8; 16];
        frame[1] = 4; // outgoing
        frame[14] = 0x08;
        frame[15] = 0x00;
        frame.extend_from_slice(&[0x45, 0x00]);
        let sll = SllHeader::parse(&frame).unwrap();
        assert_eq!(sll.protocol(), EtherType::Ipv4);
        assert_eq!(sll.payload().len(), 2);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(SllHeader::parse(&[0u8; 15]).is_err());
    }
}
