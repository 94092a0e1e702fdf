//! Scripted socket handler for tests
//!
//! Accepts, reads and connect results are queued up front; writes, closes,
//! connect targets and listener changes are recorded for assertions.

use crate::{PipeOwner, SocketHandler};
use parking_lot::Mutex;
use portfwd_proto::{SocketEndpoint, SocketFd};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;

/// First fd handed out for listeners
pub const FIRST_LISTEN_FD: SocketFd = 100;

#[derive(Debug)]
enum ScriptedRead {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

#[derive(Default)]
struct FakeState {
    next_listen_fd: SocketFd,
    listeners: HashMap<SocketEndpoint, BTreeSet<SocketFd>>,
    accepts: HashMap<SocketFd, VecDeque<SocketFd>>,
    reads: HashMap<SocketFd, VecDeque<ScriptedRead>>,
    connect_results: VecDeque<SocketFd>,
    failing_listens: HashSet<SocketEndpoint>,
    failing_writes: HashSet<SocketFd>,
    write_limits: HashMap<SocketFd, usize>,
    written: HashMap<SocketFd, Vec<u8>>,
    write_calls: HashMap<SocketFd, Vec<Vec<u8>>>,
    active: BTreeSet<SocketFd>,
    closed: Vec<SocketFd>,
    connects: Vec<SocketEndpoint>,
    listens: Vec<SocketEndpoint>,
    stopped: Vec<SocketEndpoint>,
    secured: Vec<(SocketEndpoint, Option<PipeOwner>)>,
}

/// In-memory [`SocketHandler`]
pub struct FakeSocketHandler {
    state: Mutex<FakeState>,
}

impl Default for FakeSocketHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSocketHandler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_listen_fd: FIRST_LISTEN_FD,
                ..FakeState::default()
            }),
        }
    }

    /// Queue a connection to be returned by `accept(listen_fd)`
    pub fn queue_accept(&self, listen_fd: SocketFd, fd: SocketFd) {
        self.state
            .lock()
            .accepts
            .entry(listen_fd)
            .or_default()
            .push_back(fd);
    }

    pub fn queue_read(&self, fd: SocketFd, data: &[u8]) {
        self.push_read(fd, ScriptedRead::Data(data.to_vec()));
    }

    pub fn queue_eof(&self, fd: SocketFd) {
        self.push_read(fd, ScriptedRead::Eof);
    }

    pub fn queue_read_error(&self, fd: SocketFd, kind: io::ErrorKind) {
        self.push_read(fd, ScriptedRead::Error(kind));
    }

    fn push_read(&self, fd: SocketFd, read: ScriptedRead) {
        self.state
            .lock()
            .reads
            .entry(fd)
            .or_default()
            .push_back(read);
    }

    /// Next `connect` succeeds with `fd`. Without a queued result it fails.
    pub fn queue_connect(&self, fd: SocketFd) {
        self.state.lock().connect_results.push_back(fd);
    }

    pub fn fail_listen(&self, endpoint: SocketEndpoint) {
        self.state.lock().failing_listens.insert(endpoint);
    }

    pub fn fail_writes(&self, fd: SocketFd) {
        self.state.lock().failing_writes.insert(fd);
    }

    /// Cap how many bytes a single `write` to `fd` accepts
    pub fn set_write_limit(&self, fd: SocketFd, limit: usize) {
        self.state.lock().write_limits.insert(fd, limit);
    }

    /// Everything written to `fd`, concatenated
    pub fn written(&self, fd: SocketFd) -> Vec<u8> {
        self.state
            .lock()
            .written
            .get(&fd)
            .cloned()
            .unwrap_or_default()
    }

    /// Buffers passed to each successful `write` on `fd`
    pub fn write_calls(&self, fd: SocketFd) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .write_calls
            .get(&fd)
            .cloned()
            .unwrap_or_default()
    }

    pub fn closed(&self) -> Vec<SocketFd> {
        self.state.lock().closed.clone()
    }

    pub fn close_count(&self, fd: SocketFd) -> usize {
        self.state.lock().closed.iter().filter(|&&c| c == fd).count()
    }

    pub fn connects(&self) -> Vec<SocketEndpoint> {
        self.state.lock().connects.clone()
    }

    pub fn listens(&self) -> Vec<SocketEndpoint> {
        self.state.lock().listens.clone()
    }

    pub fn stopped(&self) -> Vec<SocketEndpoint> {
        self.state.lock().stopped.clone()
    }

    pub fn secured(&self) -> Vec<(SocketEndpoint, Option<PipeOwner>)> {
        self.state.lock().secured.clone()
    }
}

impl SocketHandler for FakeSocketHandler {
    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<BTreeSet<SocketFd>> {
        let mut state = self.state.lock();
        state.listens.push(endpoint.clone());
        if state.failing_listens.contains(endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already in use", endpoint),
            ));
        }
        if let Some(fds) = state.listeners.get(endpoint) {
            return Ok(fds.clone());
        }
        let fd = state.next_listen_fd;
        state.next_listen_fd += 1;
        let fds = BTreeSet::from([fd]);
        state.listeners.insert(endpoint.clone(), fds.clone());
        Ok(fds)
    }

    fn get_endpoint_fds(&self, endpoint: &SocketEndpoint) -> BTreeSet<SocketFd> {
        self.state
            .lock()
            .listeners
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    fn accept(&self, listen_fd: SocketFd) -> io::Result<Option<SocketFd>> {
        let mut state = self.state.lock();
        let next = state
            .accepts
            .get_mut(&listen_fd)
            .and_then(|queue| queue.pop_front());
        if let Some(fd) = next {
            state.active.insert(fd);
        }
        Ok(next)
    }

    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<SocketFd> {
        let mut state = self.state.lock();
        state.connects.push(endpoint.clone());
        match state.connect_results.pop_front() {
            Some(fd) => {
                state.active.insert(fd);
                Ok(fd)
            }
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "Connection refused",
            )),
        }
    }

    fn has_data(&self, fd: SocketFd) -> bool {
        self.state
            .lock()
            .reads
            .get(&fd)
            .map_or(false, |queue| !queue.is_empty())
    }

    fn read(&self, fd: SocketFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let Some(queue) = state.reads.get_mut(&fd) else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        match queue.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ScriptedRead::Eof) => Ok(0),
            Some(ScriptedRead::Error(kind)) => Err(kind.into()),
            Some(ScriptedRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    queue.push_front(ScriptedRead::Data(data[n..].to_vec()));
                }
                Ok(n)
            }
        }
    }

    fn write(&self, fd: SocketFd, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.failing_writes.contains(&fd) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Broken pipe"));
        }
        let n = state
            .write_limits
            .get(&fd)
            .map_or(buf.len(), |&limit| limit.min(buf.len()));
        state
            .written
            .entry(fd)
            .or_default()
            .extend_from_slice(&buf[..n]);
        state
            .write_calls
            .entry(fd)
            .or_default()
            .push(buf[..n].to_vec());
        Ok(n)
    }

    fn close(&self, fd: SocketFd) {
        let mut state = self.state.lock();
        state.closed.push(fd);
        state.active.remove(&fd);
        state.reads.remove(&fd);
    }

    fn stop_listening(&self, endpoint: &SocketEndpoint) {
        let mut state = self.state.lock();
        state.stopped.push(endpoint.clone());
        state.listeners.remove(endpoint);
    }

    fn active_sockets(&self) -> Vec<SocketFd> {
        self.state.lock().active.iter().copied().collect()
    }

    fn secure_endpoint(
        &self,
        endpoint: &SocketEndpoint,
        owner: Option<PipeOwner>,
    ) -> io::Result<()> {
        self.state.lock().secured.push((endpoint.clone(), owner));
        Ok(())
    }
}
