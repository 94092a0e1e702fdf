//! Port Forwarding Protocol Definitions
//!
//! This crate defines the endpoint type, the port-forward message set and the
//! packet envelope those messages travel in, plus the parser for
//! command-line tunnel arguments.

pub mod endpoint;
pub mod messages;
pub mod packet;
pub mod tunnel_spec;

pub use endpoint::SocketEndpoint;
pub use messages::*;
pub use packet::{Packet, PacketMessage, PacketType, ProtoError};
pub use tunnel_spec::{parse_ranges_to_requests, parse_ssh_tunnel_arg, TunnelParseError};

/// Locally meaningful socket handle (a raw fd on unix)
pub type SocketFd = i32;

/// Tunnel-wide stream identifier, minted by the side that opens the destination
pub type SocketId = u32;

/// Host used when a tunnel argument names only a port
pub const DEFAULT_HOST: &str = "localhost";
