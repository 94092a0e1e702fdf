//! Port-forward handler
//!
//! Multiplexes any number of forwarded TCP and unix-socket streams over one
//! ordered session connection. Each stream is known locally by its fd and
//! across the tunnel by a socket id minted by the side that opened the real
//! destination.

pub mod config;
pub mod connection;
pub mod destination;
pub mod error;
pub mod handler;
pub mod socket_map;
pub mod source;

pub use config::HandlerConfig;
pub use connection::{BufferedConnection, Connection};
pub use destination::ForwardDestinationHandler;
pub use error::{ConnectionError, HandlerError, SetupError};
pub use handler::{HandlerEvent, PortForwardHandler};
pub use socket_map::SocketIdMap;
pub use source::ForwardSourceHandler;

pub use portfwd_socket::PipeOwner;
