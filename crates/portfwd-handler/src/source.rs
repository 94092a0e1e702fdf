//! Listening side of one forwarding rule

use crate::socket_map::SocketIdMap;
use crate::HandlerError;
use portfwd_proto::{PortForwardData, SocketEndpoint, SocketFd, SocketId};
use portfwd_socket::SocketHandler;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Accepts local connections for one rule and relays its bound streams
///
/// Accepted fds stay pending until the peer reports the socket id of the
/// destination it opened. Dropping the handler stops listening.
pub struct ForwardSourceHandler {
    socket_handler: Arc<dyn SocketHandler>,
    source: SocketEndpoint,
    destination: SocketEndpoint,
    pending: BTreeMap<SocketFd, Instant>,
    bound: SocketIdMap<()>,
    // Removed after the listener is gone
    pipe_directory: Option<TempDir>,
}

impl ForwardSourceHandler {
    /// Start listening on `source`
    pub fn new(
        socket_handler: Arc<dyn SocketHandler>,
        source: SocketEndpoint,
        destination: SocketEndpoint,
    ) -> io::Result<Self> {
        socket_handler.listen(&source)?;
        Ok(Self {
            socket_handler,
            source,
            destination,
            pending: BTreeMap::new(),
            bound: SocketIdMap::new(),
            pipe_directory: None,
        })
    }

    /// Tie a private directory holding the listening pipe to this rule
    pub(crate) fn with_pipe_directory(mut self, directory: Option<TempDir>) -> Self {
        self.pipe_directory = directory;
        self
    }

    pub fn source(&self) -> &SocketEndpoint {
        &self.source
    }

    pub fn destination(&self) -> &SocketEndpoint {
        &self.destination
    }

    pub fn socket_handler(&self) -> &Arc<dyn SocketHandler> {
        &self.socket_handler
    }

    /// Accept every waiting connection and mark it pending
    pub fn listen(&mut self) -> Vec<SocketFd> {
        let mut accepted = Vec::new();
        for listen_fd in self.socket_handler.get_endpoint_fds(&self.source) {
            loop {
                match self.socket_handler.accept(listen_fd) {
                    Ok(Some(fd)) => {
                        info!(
                            "Tunnel {} -> {} socket created with fd {}",
                            self.source, self.destination, fd
                        );
                        self.pending.insert(fd, Instant::now());
                        accepted.push(fd);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Accept on {} (fd {}) failed: {}", self.source, listen_fd, e);
                        break;
                    }
                }
            }
        }
        accepted
    }

    /// Drain readable bound sockets into data messages
    ///
    /// End of stream and read errors close the fd, drop the binding and
    /// emit a `Closed` or `Error` message for the peer.
    pub fn update(&mut self, data: &mut Vec<PortForwardData>, read_buffer_size: usize) {
        let mut buf = vec![0u8; read_buffer_size.max(1)];
        let mut finished = Vec::new();

        for (socket_id, fd) in self.bound.bindings() {
            while self.socket_handler.has_data(fd) {
                match self.socket_handler.read(fd, &mut buf) {
                    Ok(0) => {
                        debug!("Got close reading socket {}", socket_id);
                        data.push(PortForwardData::closed(socket_id, true));
                        finished.push(socket_id);
                        break;
                    }
                    Ok(n) => {
                        debug!("Reading {} bytes from socket {}", n, socket_id);
                        data.push(PortForwardData::buffer(socket_id, true, buf[..n].to_vec()));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("Got error reading socket {}: {}", socket_id, e);
                        data.push(PortForwardData::error(socket_id, true, e.to_string()));
                        finished.push(socket_id);
                        break;
                    }
                }
            }
        }

        for socket_id in finished {
            self.close_socket(socket_id);
        }
    }

    pub fn has_pending_fd(&self, fd: SocketFd) -> bool {
        self.pending.contains_key(&fd)
    }

    pub fn has_bound_fd(&self, fd: SocketFd) -> bool {
        self.bound.contains_fd(fd)
    }

    pub fn has_socket_id(&self, socket_id: SocketId) -> bool {
        self.bound.contains_id(socket_id)
    }

    /// Close a pending fd; false when it was not pending here
    pub fn close_pending_fd(&mut self, fd: SocketFd) -> bool {
        if self.pending.remove(&fd).is_none() {
            return false;
        }
        self.socket_handler.close(fd);
        true
    }

    /// Close a bound fd and forget its socket id
    pub fn close_bound_fd(&mut self, fd: SocketFd) -> Option<SocketId> {
        let (socket_id, ()) = self.bound.remove_by_fd(fd)?;
        self.socket_handler.close(fd);
        Some(socket_id)
    }

    /// Promote a pending fd to a bound stream
    pub fn add_socket(&mut self, socket_id: SocketId, fd: SocketFd) -> Result<(), HandlerError> {
        if !self.pending.contains_key(&fd) {
            return Err(HandlerError::UnknownSourceFd(fd));
        }
        self.bound.insert(socket_id, fd, ())?;
        self.pending.remove(&fd);
        info!("Adding socket: {} {}", socket_id, fd);
        Ok(())
    }

    /// Write to the fd bound to `socket_id`
    ///
    /// A failed write closes the stream here; the caller tells the peer.
    pub fn send_data_on_socket(
        &mut self,
        socket_id: SocketId,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<()> {
        let fd = self.bound.fd_of(socket_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("socket id {} is not bound", socket_id),
            )
        })?;
        if let Err(e) = self.socket_handler.write_all_or_return(fd, data, timeout) {
            self.close_socket(socket_id);
            return Err(e);
        }
        Ok(())
    }

    /// Close the fd bound to `socket_id`; false when unknown
    pub fn close_socket(&mut self, socket_id: SocketId) -> bool {
        match self.bound.remove_by_id(socket_id) {
            Some((fd, ())) => {
                self.socket_handler.close(fd);
                true
            }
            None => false,
        }
    }

    /// Close pending fds accepted more than `timeout` ago
    pub fn expire_pending(&mut self, timeout: Duration) -> Vec<SocketFd> {
        let now = Instant::now();
        let expired: Vec<SocketFd> = self
            .pending
            .iter()
            .filter(|(_, accepted_at)| now.duration_since(**accepted_at) >= timeout)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in &expired {
            info!("No destination for fd {} after {:?}, closing", fd, timeout);
            self.close_pending_fd(*fd);
        }
        expired
    }

    /// Close every pending and bound fd, returning the closed socket ids
    pub fn close_all(&mut self) -> Vec<SocketId> {
        for fd in std::mem::take(&mut self.pending).into_keys() {
            self.socket_handler.close(fd);
        }
        self.bound
            .drain()
            .into_iter()
            .map(|(socket_id, fd, ())| {
                self.socket_handler.close(fd);
                socket_id
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }
}

impl Drop for ForwardSourceHandler {
    fn drop(&mut self) {
        self.socket_handler.stop_listening(&self.source);
    }
}
