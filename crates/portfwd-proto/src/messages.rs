//! Port-forward message types

use crate::{PacketMessage, PacketType, SocketEndpoint, SocketFd, SocketId};
use serde::{Deserialize, Serialize};

/// Ask the peer (or the local handler) to register a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRequest {
    /// Endpoint to listen on. Absent for environment-variable pipe forwards,
    /// where the listening side picks a private temporary path.
    pub source: Option<SocketEndpoint>,
    /// Endpoint the forwarded streams ultimately reach
    pub destination: SocketEndpoint,
    /// Environment variable that should receive the generated pipe path
    pub environment_variable: Option<String>,
}

impl SourceRequest {
    /// TCP forward from `source` to `destination`
    pub fn new(source: SocketEndpoint, destination: SocketEndpoint) -> Self {
        Self {
            source: Some(source),
            destination,
            environment_variable: None,
        }
    }

    /// Pipe forward whose listening path is exported through `variable`
    pub fn environment(variable: impl Into<String>, destination: SocketEndpoint) -> Self {
        Self {
            source: None,
            destination,
            environment_variable: Some(variable.into()),
        }
    }
}

/// Result of registering a forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceResponse {
    pub error: Option<String>,
    /// Path of the pipe created for environment-variable forwards
    pub source_name: Option<String>,
}

impl SourceResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn created(source_name: impl Into<String>) -> Self {
        Self {
            error: None,
            source_name: Some(source_name.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            source_name: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Sent by the side that accepted a local connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationRequest {
    pub destination: SocketEndpoint,
    /// Requester-local fd, echoed back in the response
    pub fd: SocketFd,
}

/// Outcome of opening a destination connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationResult {
    Connected { socket_id: SocketId },
    Failed { error: String },
}

/// Answer to a [`DestinationRequest`], exactly one per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationResponse {
    pub client_fd: SocketFd,
    pub result: DestinationResult,
}

impl DestinationResponse {
    pub fn connected(client_fd: SocketFd, socket_id: SocketId) -> Self {
        Self {
            client_fd,
            result: DestinationResult::Connected { socket_id },
        }
    }

    pub fn failed(client_fd: SocketFd, error: impl Into<String>) -> Self {
        Self {
            client_fd,
            result: DestinationResult::Failed {
                error: error.into(),
            },
        }
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        match self.result {
            DestinationResult::Connected { socket_id } => Some(socket_id),
            DestinationResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.result {
            DestinationResult::Connected { .. } => None,
            DestinationResult::Failed { error } => Some(error.as_str()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

/// Body of a data message. Exactly one of these per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPayload {
    Buffer(#[serde(with = "serde_bytes")] Vec<u8>),
    Closed,
    Error(String),
}

/// One chunk of a forwarded stream, or its end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardData {
    pub socket_id: SocketId,
    /// True when travelling from the accepting side towards the destination
    pub source_to_destination: bool,
    pub payload: DataPayload,
}

impl PortForwardData {
    pub fn buffer(socket_id: SocketId, source_to_destination: bool, data: Vec<u8>) -> Self {
        Self {
            socket_id,
            source_to_destination,
            payload: DataPayload::Buffer(data),
        }
    }

    pub fn closed(socket_id: SocketId, source_to_destination: bool) -> Self {
        Self {
            socket_id,
            source_to_destination,
            payload: DataPayload::Closed,
        }
    }

    pub fn error(
        socket_id: SocketId,
        source_to_destination: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            socket_id,
            source_to_destination,
            payload: DataPayload::Error(message.into()),
        }
    }

    /// True for `Closed` and `Error`, which both end the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self.payload, DataPayload::Buffer(_))
    }
}

impl PacketMessage for SourceRequest {
    const PACKET_TYPE: PacketType = PacketType::SourceRequest;
}

impl PacketMessage for SourceResponse {
    const PACKET_TYPE: PacketType = PacketType::SourceResponse;
}

impl PacketMessage for DestinationRequest {
    const PACKET_TYPE: PacketType = PacketType::DestinationRequest;
}

impl PacketMessage for DestinationResponse {
    const PACKET_TYPE: PacketType = PacketType::DestinationResponse;
}

impl PacketMessage for PortForwardData {
    const PACKET_TYPE: PacketType = PacketType::Data;
}

// Byte buffers go through serialize_bytes so bincode writes them as one slice
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
