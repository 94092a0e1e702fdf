//! Connected side of one forwarded stream

use portfwd_proto::{PortForwardData, SocketFd, SocketId};
use portfwd_socket::SocketHandler;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Destination connection opened on behalf of the peer
pub struct ForwardDestinationHandler {
    socket_handler: Arc<dyn SocketHandler>,
    fd: Option<SocketFd>,
    socket_id: SocketId,
}

impl ForwardDestinationHandler {
    pub fn new(socket_handler: Arc<dyn SocketHandler>, fd: SocketFd, socket_id: SocketId) -> Self {
        Self {
            socket_handler,
            fd: Some(fd),
            socket_id,
        }
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Close the destination socket. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            self.socket_handler.close(fd);
        }
    }

    pub fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        let fd = self
            .fd
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket already closed"))?;
        self.socket_handler.write_all_or_return(fd, data, timeout)
    }

    /// Relay readable data back towards the source side
    ///
    /// Returns false once the socket has been closed by EOF or an error.
    pub fn update(&mut self, data: &mut Vec<PortForwardData>, read_buffer_size: usize) -> bool {
        let Some(fd) = self.fd else {
            return false;
        };
        let mut buf = vec![0u8; read_buffer_size.max(1)];

        while self.socket_handler.has_data(fd) {
            match self.socket_handler.read(fd, &mut buf) {
                Ok(0) => {
                    debug!("Destination socket {} closed", self.socket_id);
                    data.push(PortForwardData::closed(self.socket_id, false));
                    self.close();
                    return false;
                }
                Ok(n) => {
                    debug!("Reading {} bytes from destination socket {}", n, self.socket_id);
                    data.push(PortForwardData::buffer(self.socket_id, false, buf[..n].to_vec()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("Error reading destination socket {}: {}", self.socket_id, e);
                    data.push(PortForwardData::error(self.socket_id, false, e.to_string()));
                    self.close();
                    return false;
                }
            }
        }
        true
    }
}
