//! Fixed-width header codec.
//!
//! Layout, all fields big-endian:
//!
//! ```text
//!  0    2    4    6    8     10   11
//!  +----+----+----+----+-----+----+
//!  |src |src |dst |dst | pid |type|
//!  |node|port|node|port|     |    |
//!  +----+----+----+----+-----+----+
//! ```
//!
//! The packet id sits in a 16-bit field; only the low byte carries the id.

use thiserror::Error;

use crate::types::{Address, PacketHeader, PacketType, HEADER_LEN};

const OFF_SRC_NODE: usize = 0;
const OFF_SRC_PORT: usize = 2;
const OFF_DST_NODE: usize = 4;
const OFF_DST_PORT: usize = 6;
const OFF_PID: usize = 8;
const OFF_TYPE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed header: expected 11 bytes, got {len}")]
    MalformedHeader { len: usize },
}

pub fn encode(header: &PacketHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    put_u16(&mut buf, OFF_SRC_NODE, header.source.node);
    put_u16(&mut buf, OFF_SRC_PORT, header.source.port);
    put_u16(&mut buf, OFF_DST_NODE, header.destination.node);
    put_u16(&mut buf, OFF_DST_PORT, header.destination.port);
    put_u16(&mut buf, OFF_PID, header.packet_id as u16);
    buf[OFF_TYPE] = header.packet_type.as_byte();
    buf
}

pub fn decode(buf: &[u8]) -> Result<PacketHeader, CodecError> {
    if buf.len() != HEADER_LEN {
        return Err(CodecError::MalformedHeader { len: buf.len() });
    }
    Ok(PacketHeader {
        source: Address {
            node: get_u16(buf, OFF_SRC_NODE),
            port: get_u16(buf, OFF_SRC_PORT),
        },
        destination: Address {
            node: get_u16(buf, OFF_DST_NODE),
            port: get_u16(buf, OFF_DST_PORT),
        },
        packet_id: (get_u16(buf, OFF_PID) & 0x00ff) as u8,
        packet_type: PacketType::from(buf[OFF_TYPE]),
    })
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        encode(self)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, CodecError> {
        decode(buf)
    }
}

#[inline]
fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        PacketHeader {
            source: Address { node: 0xbeef, port: 3 },
            destination: Address { node: 0x0102, port: 0xfffe },
            packet_id: 200,
            packet_type: PacketType::Ack,
        }
    }

    #[test]
    fn layout_is_big_endian() {
        let bytes = encode(&sample());
        assert_eq!(
            bytes,
            [0xbe, 0xef, 0x00, 0x03, 0x01, 0x02, 0xff, 0xfe, 0x00, 200, 1]
        );
    }

    #[test]
    fn round_trip_across_ids_and_types() {
        let types = [
            PacketType::Data,
            PacketType::Ack,
            PacketType::Control,
            PacketType::Unknown(0x7f),
        ];
        for packet_id in 0..=u8::MAX {
            for packet_type in types {
                let h = PacketHeader {
                    source: Address { node: packet_id as u16 * 257, port: 1 },
                    destination: Address::BROADCAST,
                    packet_id,
                    packet_type,
                };
                assert_eq!(decode(&encode(&h)), Ok(h));
            }
        }
    }

    #[test]
    fn wrong_length_is_malformed() {
        let bytes = encode(&sample());
        assert_eq!(
            decode(&bytes[..10]),
            Err(CodecError::MalformedHeader { len: 10 })
        );
        let mut padded = bytes.to_vec();
        padded.push(0);
        assert_eq!(
            PacketHeader::from_bytes(&padded),
            Err(CodecError::MalformedHeader { len: 12 })
        );
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn high_pid_byte_is_ignored() {
        let mut bytes = encode(&sample());
        bytes[OFF_PID] = 0x01;
        assert_eq!(decode(&bytes).map(|h| h.packet_id), Ok(200));
    }
}
