//! Port-forward sessions
//!
//! Runs a [`portfwd_handler::PortForwardHandler`] over a length-delimited
//! packet stream: the `connect` side registers tunnels and the `serve` side
//! answers them, one handler per connection.

pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use error::SessionError;
pub use server::{bind_and_serve, connect, serve};
pub use session::{local_handler, Session};
pub use transport::{PacketReceiver, PacketSender, PacketTransport};
