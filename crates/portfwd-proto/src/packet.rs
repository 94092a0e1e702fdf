//! Packet envelope shared with the session transport

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Packet type tags for the port-forward message set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    SourceRequest = 1,
    SourceResponse = 2,
    DestinationRequest = 3,
    DestinationResponse = 4,
    Data = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::SourceRequest),
            2 => Ok(PacketType::SourceResponse),
            3 => Ok(PacketType::DestinationRequest),
            4 => Ok(PacketType::DestinationResponse),
            5 => Ok(PacketType::Data),
            _ => Err(ProtoError::UnknownPacketType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Expected {expected:?} packet, got {actual:?}")]
    UnexpectedPacketType {
        expected: PacketType,
        actual: PacketType,
    },

    #[error("Empty packet")]
    EmptyPacket,

    #[error("Payload codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// A message that travels as the payload of one packet type
pub trait PacketMessage: Serialize + DeserializeOwned {
    const PACKET_TYPE: PacketType;
}

/// Type tag plus opaque serialized payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    /// Header size: packet type (1) = 1 byte
    pub const HEADER_SIZE: usize = 1;

    pub fn new(packet_type: PacketType, payload: Bytes) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    /// Serialize a message into a packet tagged with its type
    pub fn from_message<M: PacketMessage>(message: &M) -> Result<Self, ProtoError> {
        let payload = bincode::serialize(message)?;
        Ok(Self::new(M::PACKET_TYPE, Bytes::from(payload)))
    }

    /// Deserialize the payload, checking the tag first
    pub fn decode_message<M: PacketMessage>(&self) -> Result<M, ProtoError> {
        if self.packet_type != M::PACKET_TYPE {
            return Err(ProtoError::UnexpectedPacketType {
                expected: M::PACKET_TYPE,
                actual: self.packet_type,
            });
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.put_u8(self.packet_type as u8);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode packet from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if buf.remaining() < Self::HEADER_SIZE {
            return Err(ProtoError::EmptyPacket);
        }
        let packet_type = PacketType::try_from(buf.get_u8())?;
        Ok(Self::new(packet_type, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DestinationRequest, PortForwardData, SocketEndpoint};

    #[test]
    fn test_packet_encode_decode() {
        let request = DestinationRequest {
            destination: SocketEndpoint::port(8080),
            fd: 100,
        };
        let packet = Packet::from_message(&request).unwrap();
        assert_eq!(packet.packet_type, PacketType::DestinationRequest);

        let decoded = Packet::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);

        let message: DestinationRequest = decoded.decode_message().unwrap();
        assert_eq!(message, request);
    }

    #[test]
    fn test_unknown_packet_type() {
        let result = Packet::decode(Bytes::from_static(&[42, 1, 2, 3]));
        assert!(matches!(result, Err(ProtoError::UnknownPacketType(42))));
    }

    #[test]
    fn test_empty_packet() {
        let result = Packet::decode(Bytes::new());
        assert!(matches!(result, Err(ProtoError::EmptyPacket)));
    }

    #[test]
    fn test_decode_wrong_message_type() {
        let packet = Packet::from_message(&PortForwardData::closed(3, true)).unwrap();
        let result = packet.decode_message::<DestinationRequest>();
        assert!(matches!(
            result,
            Err(ProtoError::UnexpectedPacketType {
                expected: PacketType::DestinationRequest,
                actual: PacketType::Data,
            })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let packet = Packet::new(PacketType::DestinationResponse, Bytes::from_static(&[1]));
        let result = packet.decode_message::<crate::DestinationResponse>();
        assert!(matches!(result, Err(ProtoError::Codec(_))));
    }
}
