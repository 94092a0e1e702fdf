//! Fd table shared by the TCP and pipe handlers

use parking_lot::Mutex;
use portfwd_proto::{SocketEndpoint, SocketFd};
use socket2::{SockAddr, Socket};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    sockets: HashMap<SocketFd, Arc<Socket>>,
    listeners: HashMap<SocketEndpoint, BTreeSet<SocketFd>>,
}

/// Owns every socket a handler has opened, keyed by raw fd
#[derive(Default)]
pub(crate) struct SocketTable {
    inner: Mutex<Inner>,
}

impl SocketTable {
    pub fn listening_fds(&self, endpoint: &SocketEndpoint) -> Option<BTreeSet<SocketFd>> {
        self.inner.lock().listeners.get(endpoint).cloned()
    }

    pub fn add_listeners(
        &self,
        endpoint: &SocketEndpoint,
        sockets: Vec<Socket>,
    ) -> BTreeSet<SocketFd> {
        let mut inner = self.inner.lock();
        let mut fds = BTreeSet::new();
        for socket in sockets {
            let fd = socket.as_raw_fd();
            inner.sockets.insert(fd, Arc::new(socket));
            fds.insert(fd);
        }
        inner.listeners.insert(endpoint.clone(), fds.clone());
        fds
    }

    pub fn add_stream(&self, socket: Socket) -> SocketFd {
        let fd = socket.as_raw_fd();
        self.inner.lock().sockets.insert(fd, Arc::new(socket));
        fd
    }

    fn get(&self, fd: SocketFd) -> io::Result<Arc<Socket>> {
        self.inner.lock().sockets.get(&fd).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown fd {}", fd))
        })
    }

    /// Accept one connection; the caller configures and registers it
    pub fn accept(&self, listen_fd: SocketFd) -> io::Result<Option<Socket>> {
        let listener = self.get(listen_fd)?;
        match listener.accept() {
            Ok((socket, _)) => Ok(Some(socket)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn has_data(&self, fd: SocketFd) -> bool {
        let Ok(socket) = self.get(fd) else {
            return false;
        };
        let mut peek_buf = [MaybeUninit::<u8>::uninit(); 1];
        match socket.peek(&mut peek_buf) {
            Ok(_) => true,
            Err(e) => e.kind() != io::ErrorKind::WouldBlock,
        }
    }

    pub fn read(&self, fd: SocketFd, buf: &mut [u8]) -> io::Result<usize> {
        let socket = self.get(fd)?;
        (&*socket).read(buf)
    }

    pub fn write(&self, fd: SocketFd, buf: &[u8]) -> io::Result<usize> {
        let socket = self.get(fd)?;
        (&*socket).write(buf)
    }

    /// Drop the socket; returns false when the fd was unknown
    pub fn close(&self, fd: SocketFd) -> bool {
        let mut inner = self.inner.lock();
        for fds in inner.listeners.values_mut() {
            fds.remove(&fd);
        }
        inner.sockets.remove(&fd).is_some()
    }

    /// Drop every listener of `endpoint`; returns false when not listening
    pub fn remove_listeners(&self, endpoint: &SocketEndpoint) -> bool {
        let mut inner = self.inner.lock();
        let Some(fds) = inner.listeners.remove(endpoint) else {
            return false;
        };
        for fd in fds {
            inner.sockets.remove(&fd);
        }
        true
    }

    pub fn active_sockets(&self) -> Vec<SocketFd> {
        let inner = self.inner.lock();
        let listening: BTreeSet<SocketFd> = inner.listeners.values().flatten().copied().collect();
        let mut fds: Vec<SocketFd> = inner
            .sockets
            .keys()
            .filter(|fd| !listening.contains(fd))
            .copied()
            .collect();
        fds.sort_unstable();
        fds
    }

    pub fn local_addr(&self, fd: SocketFd) -> io::Result<SockAddr> {
        self.get(fd)?.local_addr()
    }
}
