//! Socket endpoint descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where to listen or connect: a TCP host/port pair or a unix socket path
///
/// Endpoints are plain values. Listener tables are keyed by the whole
/// endpoint, so two endpoints with the same port but different hosts are
/// distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketEndpoint {
    /// Network endpoint. A missing host means "this machine".
    Tcp { host: Option<String>, port: u16 },
    /// Filesystem socket (unix domain socket / named pipe)
    Pipe { name: String },
}

impl SocketEndpoint {
    /// Port-only endpoint
    pub fn port(port: u16) -> Self {
        SocketEndpoint::Tcp { host: None, port }
    }

    /// Host and port endpoint
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        SocketEndpoint::Tcp {
            host: Some(host.into()),
            port,
        }
    }

    /// Unix socket endpoint
    pub fn pipe(name: impl Into<String>) -> Self {
        SocketEndpoint::Pipe { name: name.into() }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, SocketEndpoint::Pipe { .. })
    }

    /// True when the endpoint refers to the local machine without naming an
    /// address family (no host, or the literal `localhost`).
    pub fn is_unqualified_localhost(&self) -> bool {
        match self {
            SocketEndpoint::Tcp { host: None, .. } => true,
            SocketEndpoint::Tcp {
                host: Some(host), ..
            } => host.eq_ignore_ascii_case(crate::DEFAULT_HOST),
            SocketEndpoint::Pipe { .. } => false,
        }
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketEndpoint::Tcp { host: None, port } => write!(f, "*:{}", port),
            SocketEndpoint::Tcp {
                host: Some(host),
                port,
            } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            SocketEndpoint::Tcp {
                host: Some(host),
                port,
            } => write!(f, "{}:{}", host, port),
            SocketEndpoint::Pipe { name } => write!(f, "{}", name),
        }
    }
}
