//! Unix domain socket handler

use crate::table::SocketTable;
use crate::{unsupported_endpoint, PipeOwner, SocketHandler};
use portfwd_proto::{SocketEndpoint, SocketFd};
use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 128;

/// Socket handler for named (filesystem) endpoints
#[derive(Default)]
pub struct PipeSocketHandler {
    table: SocketTable,
}

impl PipeSocketHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pipe_path(endpoint: &SocketEndpoint) -> io::Result<&Path> {
    match endpoint {
        SocketEndpoint::Pipe { name } => Ok(Path::new(name)),
        SocketEndpoint::Tcp { .. } => Err(unsupported_endpoint(endpoint)),
    }
}

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl SocketHandler for PipeSocketHandler {
    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<BTreeSet<SocketFd>> {
        if let Some(fds) = self.table.listening_fds(endpoint) {
            return Ok(fds);
        }
        let path = pipe_path(endpoint)?;
        remove_stale(path)?;

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        info!("Listening on pipe {}", path.display());
        Ok(self.table.add_listeners(endpoint, vec![socket]))
    }

    fn get_endpoint_fds(&self, endpoint: &SocketEndpoint) -> BTreeSet<SocketFd> {
        self.table.listening_fds(endpoint).unwrap_or_default()
    }

    fn accept(&self, listen_fd: SocketFd) -> io::Result<Option<SocketFd>> {
        let Some(socket) = self.table.accept(listen_fd)? else {
            return Ok(None);
        };
        socket.set_nonblocking(true)?;
        let fd = self.table.add_stream(socket);
        debug!("Accepted pipe fd {} on listener {}", fd, listen_fd);
        Ok(Some(fd))
    }

    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<SocketFd> {
        let path = pipe_path(endpoint)?;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.connect(&SockAddr::unix(path)?)?;
        socket.set_nonblocking(true)?;
        let fd = self.table.add_stream(socket);
        debug!("Connected pipe fd {} to {}", fd, path.display());
        Ok(fd)
    }

    fn has_data(&self, fd: SocketFd) -> bool {
        self.table.has_data(fd)
    }

    fn read(&self, fd: SocketFd, buf: &mut [u8]) -> io::Result<usize> {
        self.table.read(fd, buf)
    }

    fn write(&self, fd: SocketFd, buf: &[u8]) -> io::Result<usize> {
        self.table.write(fd, buf)
    }

    fn close(&self, fd: SocketFd) {
        if !self.table.close(fd) {
            warn!("Tried to close unknown pipe fd {}", fd);
        }
    }

    fn stop_listening(&self, endpoint: &SocketEndpoint) {
        if !self.table.remove_listeners(endpoint) {
            return;
        }
        if let Ok(path) = pipe_path(endpoint) {
            if let Err(e) = remove_stale(path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
        info!("Stopped listening on pipe {}", endpoint);
    }

    fn active_sockets(&self) -> Vec<SocketFd> {
        self.table.active_sockets()
    }

    /// Owner-only permissions, then hand the socket file to `owner`
    fn secure_endpoint(
        &self,
        endpoint: &SocketEndpoint,
        owner: Option<PipeOwner>,
    ) -> io::Result<()> {
        let path = pipe_path(endpoint)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
        if let Some(owner) = owner {
            std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        fs::write(&path, b"stale").unwrap();

        let handler = PipeSocketHandler::new();
        let endpoint = SocketEndpoint::pipe(path.to_string_lossy());
        let fds = handler.listen(&endpoint).unwrap();
        assert_eq!(fds.len(), 1);

        handler.stop_listening(&endpoint);
        assert!(!path.exists());
        assert!(handler.get_endpoint_fds(&endpoint).is_empty());
    }

    #[test]
    fn test_secure_endpoint_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let handler = PipeSocketHandler::new();
        let endpoint = SocketEndpoint::pipe(path.to_string_lossy());
        handler.listen(&endpoint).unwrap();

        handler.secure_endpoint(&endpoint, None).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_tcp_endpoint_rejected() {
        let handler = PipeSocketHandler::new();
        let err = handler.connect(&SocketEndpoint::port(80)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
