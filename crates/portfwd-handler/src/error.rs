//! Handler error types

use portfwd_proto::{ProtoError, SocketEndpoint, SocketFd, SocketId};
use std::io;
use thiserror::Error;

/// Reasons a forwarding rule is rejected
///
/// A rejected rule leaves no listener, directory or table entry behind.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Do not set a source when forwarding named pipes with environment variables")]
    SourceWithEnvironmentVariable,

    #[error("Named socket tunneling is only allowed with temporary filenames.")]
    NamedSource,

    #[error("Forward request needs either a source or an environment variable")]
    MissingSource,

    #[error("Already forwarding from {0}")]
    DuplicateSource(SocketEndpoint),

    #[error("Could not listen on {endpoint}: {source}")]
    Listen {
        endpoint: SocketEndpoint,
        #[source]
        source: io::Error,
    },

    #[error("Could not prepare pipe directory: {0}")]
    PipeDirectory(#[source] io::Error),

    #[error("Could not secure pipe {endpoint}: {source}")]
    SecurePipe {
        endpoint: SocketEndpoint,
        #[source]
        source: io::Error,
    },
}

/// Failures writing to the session channel
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
}

/// Errors surfaced by the port-forward handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("No pending connection with fd {0}")]
    UnknownSourceFd(SocketFd),

    #[error("Socket id {0} is already bound")]
    SocketIdInUse(SocketId),

    #[error("Fd {0} is already bound to a socket id")]
    FdAlreadyBound(SocketFd),

    #[error("Could not find empty socket id")]
    SocketIdsExhausted,
}
