//! Session errors

use crate::config::ConfigError;
use portfwd_handler::{ConnectionError, HandlerError};
use portfwd_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No server address configured")]
    MissingServer,

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Failed to listen on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Forward rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}
