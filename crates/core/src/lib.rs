//! packet model and frame codec for the crlink radio link

pub mod codec;
pub mod types;

pub use codec::{decode, encode, CodecError};
pub use types::{
    Address, NodeId, PacketHeader, PacketId, PacketType, Payload, HEADER_LEN, PAYLOAD_LEN,
};
