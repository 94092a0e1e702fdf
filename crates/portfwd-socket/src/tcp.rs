//! TCP socket handler

use crate::table::SocketTable;
use crate::{unsupported_endpoint, SocketHandler};
use portfwd_proto::{SocketEndpoint, SocketFd, DEFAULT_HOST};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 128;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Socket handler for host/port endpoints
///
/// A port-only endpoint listens on every interface (dual stack). The
/// `localhost` host listens on both loopback addresses.
#[derive(Default)]
pub struct TcpSocketHandler {
    table: SocketTable,
}

impl TcpSocketHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound address of a listening or connected fd
    pub fn local_addr(&self, fd: SocketFd) -> io::Result<SocketAddr> {
        self.table.local_addr(fd)?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "fd is not an inet socket")
        })
    }

    fn bind(addr: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn open(addr: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect_timeout(&SockAddr::from(addr), CONNECT_TIMEOUT)?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        Ok(socket)
    }
}

fn tcp_parts(endpoint: &SocketEndpoint) -> io::Result<(Option<&str>, u16)> {
    match endpoint {
        SocketEndpoint::Tcp { host, port } => Ok((host.as_deref(), *port)),
        SocketEndpoint::Pipe { .. } => Err(unsupported_endpoint(endpoint)),
    }
}

fn listen_addrs(host: Option<&str>, port: u16) -> io::Result<Vec<SocketAddr>> {
    match host {
        None => Ok(vec![
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ]),
        Some(host) if host.eq_ignore_ascii_case(DEFAULT_HOST) => Ok(vec![
            SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        ]),
        Some(host) => resolve(host, port),
    }
}

/// Resolve `host`, IPv6 addresses first
fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs.sort_by_key(|addr| !addr.is_ipv6());
    addrs.dedup();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        ));
    }
    Ok(addrs)
}

impl SocketHandler for TcpSocketHandler {
    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<BTreeSet<SocketFd>> {
        if let Some(fds) = self.table.listening_fds(endpoint) {
            return Ok(fds);
        }
        let (host, port) = tcp_parts(endpoint)?;

        let mut sockets = Vec::new();
        let mut last_error = None;
        for addr in listen_addrs(host, port)? {
            match Self::bind(addr) {
                Ok(socket) => {
                    debug!("Listening on {}", addr);
                    sockets.push(socket);
                }
                Err(e) => {
                    debug!("Could not listen on {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        if sockets.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to listen on")
            }));
        }
        info!("Listening on {} ({} sockets)", endpoint, sockets.len());
        Ok(self.table.add_listeners(endpoint, sockets))
    }

    fn get_endpoint_fds(&self, endpoint: &SocketEndpoint) -> BTreeSet<SocketFd> {
        self.table.listening_fds(endpoint).unwrap_or_default()
    }

    fn accept(&self, listen_fd: SocketFd) -> io::Result<Option<SocketFd>> {
        let Some(socket) = self.table.accept(listen_fd)? else {
            return Ok(None);
        };
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let fd = self.table.add_stream(socket);
        debug!("Accepted fd {} on listener {}", fd, listen_fd);
        Ok(Some(fd))
    }

    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<SocketFd> {
        let (host, port) = tcp_parts(endpoint)?;

        let mut last_error = None;
        for addr in resolve(host.unwrap_or(DEFAULT_HOST), port)? {
            match Self::open(addr) {
                Ok(socket) => {
                    let fd = self.table.add_stream(socket);
                    debug!("Connected fd {} to {}", fd, addr);
                    return Ok(fd);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", endpoint))
        }))
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
            warn!("Tried to close unknown fd {}", fd);
        }
    }

    fn stop_listening(&self, endpoint: &SocketEndpoint) {
        if self.table.remove_listeners(endpoint) {
            info!("Stopped listening on {}", endpoint);
        }
    }

    fn active_sockets(&self) -> Vec<SocketFd> {
        self.table.active_sockets()
    }
}
