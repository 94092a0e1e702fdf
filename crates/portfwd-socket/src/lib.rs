//! Socket facility for port forwarding
//!
//! The forwarding core never touches OS sockets directly. It goes through a
//! [`SocketHandler`], which hands out plain integer fds and keeps the real
//! sockets in its own table. Two implementations exist per process: one for
//! TCP endpoints ([`TcpSocketHandler`]) and one for unix domain sockets
//! ([`PipeSocketHandler`]).
//!
//! Every operation is non-blocking. "Nothing ready" is reported as
//! `Ok(None)` from [`SocketHandler::accept`] and as
//! [`std::io::ErrorKind::WouldBlock`] from [`SocketHandler::read`].

pub mod pipe;
pub mod tcp;
mod table;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use pipe::PipeSocketHandler;
pub use tcp::TcpSocketHandler;

use portfwd_proto::{SocketEndpoint, SocketFd};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::time::{Duration, Instant};

/// Pause between write attempts while the peer's receive window is full
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Owner applied to pipe listeners and their directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Non-blocking socket operations used by the forwarding core
pub trait SocketHandler: Send + Sync {
    /// Start listening on `endpoint` and return the fds backing it.
    ///
    /// Listening twice on the same endpoint returns the existing set.
    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<BTreeSet<SocketFd>>;

    /// Listening fds for `endpoint`, empty when not listening
    fn get_endpoint_fds(&self, endpoint: &SocketEndpoint) -> BTreeSet<SocketFd>;

    /// Accept one pending connection, `Ok(None)` when none is waiting
    fn accept(&self, listen_fd: SocketFd) -> io::Result<Option<SocketFd>>;

    /// Open a stream to `endpoint`
    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<SocketFd>;

    /// True when a read would not block (data, EOF or a pending error)
    fn has_data(&self, fd: SocketFd) -> bool;

    /// Read into `buf`. `Ok(0)` is end of stream.
    fn read(&self, fd: SocketFd, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: SocketFd, buf: &[u8]) -> io::Result<usize>;

    fn close(&self, fd: SocketFd);

    fn stop_listening(&self, endpoint: &SocketEndpoint);

    /// Open stream fds (listeners excluded)
    fn active_sockets(&self) -> Vec<SocketFd>;

    /// Restrict access to a listening endpoint. Only meaningful for pipes.
    fn secure_endpoint(
        &self,
        _endpoint: &SocketEndpoint,
        _owner: Option<PipeOwner>,
    ) -> io::Result<()> {
        Ok(())
    }

    /// Write the whole buffer, retrying while the socket would block.
    ///
    /// Gives up with [`io::ErrorKind::TimedOut`] once `timeout` passes
    /// without any byte being accepted; every partial write restarts the
    /// clock. Retries sleep the calling thread, so when called from an async
    /// task the executor worker running it is blocked for up to `timeout`.
    fn write_all_or_return(
        &self,
        fd: SocketFd,
        mut buf: &[u8],
        timeout: Duration,
    ) -> io::Result<()> {
        let mut last_progress = Instant::now();
        while !buf.is_empty() {
            match self.write(fd, buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("fd {} accepted no bytes", fd),
                    ))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    last_progress = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if last_progress.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("write to fd {} timed out", fd),
                        ));
                    }
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub(crate) fn unsupported_endpoint(endpoint: &SocketEndpoint) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported endpoint for this socket handler: {}", endpoint),
    )
}
