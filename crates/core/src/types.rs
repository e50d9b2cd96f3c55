use std::fmt;

use serde::{Deserialize, Serialize};

pub type NodeId = u16;
pub type PacketId = u8;

/// Encoded header length on the air.
pub const HEADER_LEN: usize = 11;
/// Fixed payload length of this protocol version.
pub const PAYLOAD_LEN: usize = 64;

pub type Payload = [u8; PAYLOAD_LEN];

/// One end of a link, made of two 16-bit sub-fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub node: NodeId,
    pub port: u16,
}

impl Address {
    pub const BROADCAST: Address = Address { node: 0xffff, port: 0xffff };

    pub fn node(node: NodeId) -> Self {
        Self { node, port: 0 }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "*")
        } else {
            write!(f, "{:04x}.{}", self.node, self.port)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Data,
    Ack,
    Control,
    /// Any type byte this protocol version does not define.
    Unknown(u8),
}

impl PacketType {
    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Ack => 1,
            PacketType::Control => 2,
            PacketType::Unknown(b) => b,
        }
    }
}

impl From<u8> for PacketType {
    fn from(b: u8) -> Self {
        match b {
            0 => PacketType::Data,
            1 => PacketType::Ack,
            2 => PacketType::Control,
            other => PacketType::Unknown(other),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Data => write!(f, "DATA"),
            PacketType::Ack => write!(f, "ACK"),
            PacketType::Control => write!(f, "CONTROL"),
            PacketType::Unknown(b) => write!(f, "UNKNOWN({b})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketHeader {
    pub source: Address,
    pub destination: Address,
    /// Wraps at 256. Only meaningful together with `packet_type`.
    pub packet_id: PacketId,
    pub packet_type: PacketType,
}

impl PacketHeader {
    pub fn data(source: Address, destination: Address, packet_id: PacketId) -> Self {
        Self { source, destination, packet_id, packet_type: PacketType::Data }
    }

    /// Ack for `data`, addressed back to its sender.
    pub fn ack_for(own: Address, data: &PacketHeader) -> Self {
        Self {
            source: own,
            destination: data.source,
            packet_id: data.packet_id,
            packet_type: PacketType::Ack,
        }
    }

    pub fn is_ack_of(&self, packet_id: PacketId) -> bool {
        self.packet_type == PacketType::Ack && self.packet_id == packet_id
    }
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} {} -> {}",
            self.packet_type, self.packet_id, self.source, self.destination
        )
    }
}
