//! Port-forward handler
//!
//! One instance runs on each side of a session. It owns every forwarding
//! rule, pending connection and bound stream of that side and is driven by
//! the session loop through [`PortForwardHandler::update`] and
//! [`PortForwardHandler::handle_packet`]. Both take `&mut self`, so they are
//! always serialized.

use crate::destination::ForwardDestinationHandler;
use crate::socket_map::SocketIdMap;
use crate::source::ForwardSourceHandler;
use crate::{Connection, HandlerConfig, HandlerError, SetupError};
use portfwd_proto::{
    DataPayload, DestinationRequest, DestinationResponse, DestinationResult, Packet,
    PacketType, PortForwardData, SocketEndpoint, SocketFd, SocketId, SourceRequest,
    SourceResponse,
};
use portfwd_socket::{PipeOwner, SocketHandler};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

const PIPE_DIRECTORY_PREFIX: &str = "portfwd-sock-";
const PIPE_FILE_NAME: &str = "sock";

/// Something the session should know about after an inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    /// The peer answered one of our source registration requests
    SourceResponse(SourceResponse),
}

/// Multiplexes forwarded streams over one session connection
pub struct PortForwardHandler {
    network: Arc<dyn SocketHandler>,
    pipe: Arc<dyn SocketHandler>,
    config: HandlerConfig,
    sources: Vec<ForwardSourceHandler>,
    destinations: SocketIdMap<ForwardDestinationHandler>,
    next_socket_id: SocketId,
    // Data messages produced outside update(), flushed on the next update
    outbound: Vec<PortForwardData>,
}

impl PortForwardHandler {
    pub fn new(
        network: Arc<dyn SocketHandler>,
        pipe: Arc<dyn SocketHandler>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            network,
            pipe,
            config,
            sources: Vec::new(),
            destinations: SocketIdMap::new(),
            next_socket_id: 1,
            outbound: Vec::new(),
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Register a forwarding rule and start listening for it
    ///
    /// Never fails outright: a rejected rule produces an error response and
    /// leaves no state behind. `owner` applies to pipe listeners only.
    pub fn create_source(
        &mut self,
        request: &SourceRequest,
        owner: Option<PipeOwner>,
    ) -> SourceResponse {
        match self.try_create_source(request, owner) {
            Ok(Some(source_name)) => SourceResponse::created(source_name),
            Ok(None) => SourceResponse::ok(),
            Err(e) => {
                warn!("Rejected forward to {}: {}", request.destination, e);
                SourceResponse::error(e.to_string())
            }
        }
    }

    fn try_create_source(
        &mut self,
        request: &SourceRequest,
        owner: Option<PipeOwner>,
    ) -> Result<Option<String>, SetupError> {
        match (&request.source, &request.environment_variable) {
            (Some(_), Some(_)) => Err(SetupError::SourceWithEnvironmentVariable),
            (None, None) => Err(SetupError::MissingSource),
            (Some(source), None) if source.is_pipe() => Err(SetupError::NamedSource),
            (Some(source), None) => {
                if self.sources.iter().any(|s| s.source() == source) {
                    return Err(SetupError::DuplicateSource(source.clone()));
                }
                let handler = ForwardSourceHandler::new(
                    self.network.clone(),
                    source.clone(),
                    request.destination.clone(),
                )
                .map_err(|e| SetupError::Listen {
                    endpoint: source.clone(),
                    source: e,
                })?;
                info!("Forwarding {} -> {}", source, request.destination);
                self.sources.push(handler);
                Ok(None)
            }
            (None, Some(variable)) => {
                let directory = self.create_pipe_directory(owner)?;
                let path = directory.path().join(PIPE_FILE_NAME);
                let source_name = path.to_string_lossy().into_owned();
                let source = SocketEndpoint::pipe(source_name.as_str());

                let handler = ForwardSourceHandler::new(
                    self.pipe.clone(),
                    source.clone(),
                    request.destination.clone(),
                )
                .map_err(|e| SetupError::Listen {
                    endpoint: source.clone(),
                    source: e,
                })?
                .with_pipe_directory(Some(directory));
                self.pipe
                    .secure_endpoint(&source, owner)
                    .map_err(|e| SetupError::SecurePipe {
                        endpoint: source.clone(),
                        source: e,
                    })?;

                info!(
                    "Creating pipe at {} for {} -> {}",
                    source_name, variable, request.destination
                );
                self.sources.push(handler);
                Ok(Some(source_name))
            }
        }
    }

    fn create_pipe_directory(&self, owner: Option<PipeOwner>) -> Result<TempDir, SetupError> {
        let parent = self
            .config
            .pipe_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let directory = tempfile::Builder::new()
            .prefix(PIPE_DIRECTORY_PREFIX)
            .tempdir_in(parent)
            .map_err(SetupError::PipeDirectory)?;
        fs::set_permissions(directory.path(), fs::Permissions::from_mode(0o700))
            .map_err(SetupError::PipeDirectory)?;
        if let Some(owner) = owner {
            std::os::unix::fs::chown(directory.path(), Some(owner.uid), Some(owner.gid))
                .map_err(SetupError::PipeDirectory)?;
        }
        Ok(directory)
    }

    /// Stop forwarding from `source`, closing its pending and bound fds
    ///
    /// The peer is told to close every bound stream on the next update.
    pub fn remove_source(&mut self, source: &SocketEndpoint) -> bool {
        let Some(index) = self.sources.iter().position(|s| s.source() == source) else {
            return false;
        };
        let mut handler = self.sources.remove(index);
        for socket_id in handler.close_all() {
            self.outbound.push(PortForwardData::closed(socket_id, true));
        }
        info!("Removed forward from {}", source);
        true
    }

    /// Open the destination of a peer's accepted connection
    pub fn create_destination(&mut self, request: &DestinationRequest) -> DestinationResponse {
        let connected = match &request.destination {
            SocketEndpoint::Tcp { port, .. } if request.destination.is_unqualified_localhost() => {
                self.connect_localhost(*port)
            }
            SocketEndpoint::Tcp { .. } => self
                .network
                .connect(&request.destination)
                .map(|fd| (fd, self.network.clone())),
            SocketEndpoint::Pipe { .. } => self
                .pipe
                .connect(&request.destination)
                .map(|fd| (fd, self.pipe.clone())),
        };
        let (fd, socket_handler) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                info!("Could not connect to {}: {}", request.destination, e);
                return DestinationResponse::failed(request.fd, e.to_string());
            }
        };

        let bound = self.mint_socket_id().and_then(|socket_id| {
            let destination = ForwardDestinationHandler::new(socket_handler.clone(), fd, socket_id);
            self.destinations.insert(socket_id, fd, destination)?;
            Ok(socket_id)
        });
        match bound {
            Ok(socket_id) => {
                info!("Created socket/fd pair: {} {}", socket_id, fd);
                DestinationResponse::connected(request.fd, socket_id)
            }
            Err(e) => {
                error!("Could not register destination fd {}: {}", fd, e);
                socket_handler.close(fd);
                DestinationResponse::failed(request.fd, e.to_string())
            }
        }
    }

    /// IPv6 loopback first, then IPv4
    fn connect_localhost(&self, port: u16) -> io::Result<(SocketFd, Arc<dyn SocketHandler>)> {
        let fd = match self.network.connect(&SocketEndpoint::tcp("::1", port)) {
            Ok(fd) => fd,
            Err(e) => {
                debug!("IPv6 connect to port {} failed ({}), trying IPv4", port, e);
                self.network.connect(&SocketEndpoint::tcp("127.0.0.1", port))?
            }
        };
        Ok((fd, self.network.clone()))
    }

    fn mint_socket_id(&mut self) -> Result<SocketId, HandlerError> {
        let socket_id = self.next_socket_id;
        self.next_socket_id = socket_id
            .checked_add(1)
            .ok_or(HandlerError::SocketIdsExhausted)?;
        Ok(socket_id)
    }

    /// One poll tick
    ///
    /// Accepts waiting connections (one destination request each) and
    /// drains readable streams on both sides into data messages. Nothing
    /// is written to the connection here.
    pub fn update(
        &mut self,
        requests: &mut Vec<DestinationRequest>,
        data: &mut Vec<PortForwardData>,
    ) {
        data.append(&mut self.outbound);
        let read_buffer_size = self.config.read_buffer_size;

        for source in &mut self.sources {
            if let Some(timeout) = self.config.pending_timeout() {
                source.expire_pending(timeout);
            }
            source.update(data, read_buffer_size);
            for fd in source.listen() {
                requests.push(DestinationRequest {
                    destination: source.destination().clone(),
                    fd,
                });
            }
        }

        let mut finished = Vec::new();
        for (socket_id, _, destination) in self.destinations.iter_mut() {
            if !destination.update(data, read_buffer_size) {
                finished.push(socket_id);
            }
        }
        for socket_id in finished {
            self.destinations.remove_by_id(socket_id);
        }
    }

    /// React to one inbound packet
    pub fn handle_packet(
        &mut self,
        packet: &Packet,
        connection: &dyn Connection,
    ) -> Result<Option<HandlerEvent>, HandlerError> {
        match packet.packet_type {
            PacketType::Data => {
                let message: PortForwardData = packet.decode_message()?;
                self.handle_data(message);
            }
            PacketType::DestinationRequest => {
                let request: DestinationRequest = packet.decode_message()?;
                info!("Got new port destination request for {}", request.destination);
                let response = self.create_destination(&request);
                connection.write_packet(Packet::from_message(&response)?)?;
            }
            PacketType::DestinationResponse => {
                let response: DestinationResponse = packet.decode_message()?;
                self.handle_destination_response(response, connection)?;
            }
            PacketType::SourceRequest => {
                let request: SourceRequest = packet.decode_message()?;
                info!("Got forward request for {}", request.destination);
                let response = self.create_source(&request, self.config.pipe_owner);
                connection.write_packet(Packet::from_message(&response)?)?;
            }
            PacketType::SourceResponse => {
                let response: SourceResponse = packet.decode_message()?;
                if let Some(message) = &response.error {
                    error!("Peer rejected forward: {}", message);
                } else if let Some(name) = &response.source_name {
                    info!("Peer created pipe at {}", name);
                } else {
                    info!("Peer accepted forward");
                }
                return Ok(Some(HandlerEvent::SourceResponse(response)));
            }
        }
        Ok(None)
    }

    fn handle_destination_response(
        &mut self,
        response: DestinationResponse,
        connection: &dyn Connection,
    ) -> Result<(), HandlerError> {
        let client_fd = response.client_fd;
        match response.result {
            DestinationResult::Failed { error } => {
                info!("Could not connect to server through tunnel: {}", error);
                self.close_source_fd(client_fd);
            }
            DestinationResult::Connected { socket_id } => {
                info!("Received socket/fd map from server: {} {}", socket_id, client_fd);
                match self.add_source_socket_id(socket_id, client_fd) {
                    Ok(()) => {}
                    Err(HandlerError::SocketIdInUse(_)) => {
                        // The id still names a live local stream; only drop the waiting fd
                        warn!(
                            "Socket id {} arrived for fd {} but is already bound",
                            socket_id, client_fd
                        );
                        self.close_pending_source_fd(client_fd);
                    }
                    Err(e) => {
                        // Nothing local will use this id; release the peer's socket
                        warn!(
                            "Releasing socket id {} for fd {}: {}",
                            socket_id, client_fd, e
                        );
                        self.close_pending_source_fd(client_fd);
                        let closed = PortForwardData::closed(socket_id, true);
                        connection.write_packet(Packet::from_message(&closed)?)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, message: PortForwardData) {
        let PortForwardData {
            socket_id,
            source_to_destination,
            payload,
        } = message;

        if !source_to_destination {
            match payload {
                DataPayload::Buffer(bytes) => {
                    debug!("Got data for source socket: {}", socket_id);
                    self.send_data_to_source_on_socket(socket_id, &bytes);
                }
                DataPayload::Closed => {
                    info!("Port forward socket closed: {}", socket_id);
                    self.close_source_socket_id(socket_id);
                }
                DataPayload::Error(e) => {
                    info!("Port forward socket errored: {} ({})", socket_id, e);
                    self.close_source_socket_id(socket_id);
                }
            }
            return;
        }

        debug!("Got data for destination socket: {}", socket_id);
        let write_timeout = self.config.write_timeout();
        let Some(destination) = self.destinations.get_mut(socket_id) else {
            warn!("Got data for a socket id that has already closed: {}", socket_id);
            return;
        };
        match payload {
            DataPayload::Buffer(bytes) => {
                if let Err(e) = destination.write(&bytes, write_timeout) {
                    warn!("Write to destination socket {} failed: {}", socket_id, e);
                    self.close_destination(socket_id);
                    self.outbound
                        .push(PortForwardData::error(socket_id, false, e.to_string()));
                }
            }
            DataPayload::Closed => {
                info!("Port forward socket closed: {}", socket_id);
                self.close_destination(socket_id);
            }
            DataPayload::Error(e) => {
                info!("Port forward socket errored: {} ({})", socket_id, e);
                self.close_destination(socket_id);
            }
        }
    }

    fn close_destination(&mut self, socket_id: SocketId) {
        if let Some((_, mut destination)) = self.destinations.remove_by_id(socket_id) {
            destination.close();
        }
    }

    /// Close a pending or bound local fd. Unknown fds are ignored.
    pub fn close_source_fd(&mut self, fd: SocketFd) {
        for source in &mut self.sources {
            if source.close_pending_fd(fd) {
                return;
            }
            if let Some(socket_id) = source.close_bound_fd(fd) {
                debug!("Closed fd {} bound to socket id {}", fd, socket_id);
                return;
            }
        }
        debug!("Tried to close fd {} which is neither pending nor bound", fd);
    }

    fn close_pending_source_fd(&mut self, fd: SocketFd) -> bool {
        self.sources
            .iter_mut()
            .any(|source| source.close_pending_fd(fd))
    }

    /// Bind `socket_id` to a pending local fd
    pub fn add_source_socket_id(
        &mut self,
        socket_id: SocketId,
        fd: SocketFd,
    ) -> Result<(), HandlerError> {
        if self.sources.iter().any(|s| s.has_socket_id(socket_id)) {
            return Err(HandlerError::SocketIdInUse(socket_id));
        }
        if self.sources.iter().any(|s| s.has_bound_fd(fd)) {
            return Err(HandlerError::FdAlreadyBound(fd));
        }
        let source = self
            .sources
            .iter_mut()
            .find(|s| s.has_pending_fd(fd))
            .ok_or(HandlerError::UnknownSourceFd(fd))?;
        source.add_socket(socket_id, fd)
    }

    /// Close the local fd bound to `socket_id`. Unknown ids are ignored.
    pub fn close_source_socket_id(&mut self, socket_id: SocketId) {
        let closed = self
            .sources
            .iter_mut()
            .any(|source| source.close_socket(socket_id));
        if !closed {
            warn!("Tried to close a socket id that doesn't exist: {}", socket_id);
        }
    }

    /// Write `data` to the local fd bound to `socket_id`
    ///
    /// Unknown ids are ignored. A failed write tears the stream down and
    /// queues an error message for the peer.
    pub fn send_data_to_source_on_socket(&mut self, socket_id: SocketId, data: &[u8]) {
        let write_timeout = self.config.write_timeout();
        let Some(source) = self
            .sources
            .iter_mut()
            .find(|source| source.has_socket_id(socket_id))
        else {
            warn!("Tried to send data on a socket id that doesn't exist: {}", socket_id);
            return;
        };
        if let Err(e) = source.send_data_on_socket(socket_id, data, write_timeout) {
            warn!("Write to forwarded socket {} failed: {}", socket_id, e);
            self.outbound
                .push(PortForwardData::error(socket_id, true, e.to_string()));
        }
    }

    /// Close everything: listeners, pending and bound fds, destinations
    pub fn close_all(&mut self) {
        for source in &mut self.sources {
            source.close_all();
        }
        self.sources.clear();
        for (_, _, mut destination) in self.destinations.drain() {
            destination.close();
        }
        self.outbound.clear();
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn pending_count(&self) -> usize {
        self.sources.iter().map(|s| s.pending_count()).sum()
    }

    pub fn bound_count(&self) -> usize {
        self.sources.iter().map(|s| s.bound_count()).sum()
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Endpoints of every registered rule
    pub fn source_endpoints(&self) -> Vec<&SocketEndpoint> {
        self.sources.iter().map(|s| s.source()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferedConnection;
    use portfwd_socket::testing::{FakeSocketHandler, FIRST_LISTEN_FD};

    struct Fixture {
        network: Arc<FakeSocketHandler>,
        pipe: Arc<FakeSocketHandler>,
        handler: PortForwardHandler,
        connection: BufferedConnection,
    }

    fn fixture() -> Fixture {
        let network = Arc::new(FakeSocketHandler::new());
        let pipe = Arc::new(FakeSocketHandler::new());
        let handler =
            PortForwardHandler::new(network.clone(), pipe.clone(), HandlerConfig::default());
        Fixture {
            network,
            pipe,
            handler,
            connection: BufferedConnection::new(),
        }
    }

    fn port_forward(source: u16, destination: u16) -> SourceRequest {
        SourceRequest::new(SocketEndpoint::port(source), SocketEndpoint::port(destination))
    }

    fn destination_request(destination: SocketEndpoint, fd: SocketFd) -> DestinationRequest {
        DestinationRequest { destination, fd }
    }

    /// Register 8080 -> 9090 and accept fd 123
    fn pending_connection(f: &mut Fixture) {
        let response = f.handler.create_source(&port_forward(8080, 9090), None);
        assert!(!response.is_error());
        f.network.queue_accept(FIRST_LISTEN_FD, 123);
        let mut requests = Vec::new();
        f.handler.update(&mut requests, &mut Vec::new());
        assert_eq!(requests.len(), 1);
    }

    fn handle<M: portfwd_proto::PacketMessage>(f: &mut Fixture, message: &M) -> Option<HandlerEvent> {
        let packet = Packet::from_message(message).unwrap();
        f.handler.handle_packet(&packet, &f.connection).unwrap()
    }

    #[test]
    fn test_update_with_no_handlers() {
        let mut f = fixture();
        let mut requests = Vec::new();
        let mut data = Vec::new();

        f.handler.update(&mut requests, &mut data);

        assert!(requests.is_empty());
        assert!(data.is_empty());
    }

    #[test]
    fn test_create_source_with_port_forward() {
        let mut f = fixture();
        let response = f.handler.create_source(&port_forward(8080, 9090), None);

        assert!(!response.is_error());
        assert_eq!(response.source_name, None);
        assert_eq!(f.network.listens(), vec![SocketEndpoint::port(8080)]);
        assert_eq!(f.handler.source_count(), 1);
    }

    #[test]
    fn test_create_source_rejects_named_source() {
        let mut f = fixture();
        let request = SourceRequest::new(
            SocketEndpoint::pipe("/tmp/source.sock"),
            SocketEndpoint::pipe("/tmp/dest.sock"),
        );

        let response = f.handler.create_source(&request, None);

        assert_eq!(
            response.error.as_deref(),
            Some("Named socket tunneling is only allowed with temporary filenames.")
        );
        assert!(f.pipe.listens().is_empty());
        assert!(f.network.listens().is_empty());
        assert_eq!(f.handler.source_count(), 0);
    }

    #[test]
    fn test_create_source_rejects_source_with_environment_variable() {
        let mut f = fixture();
        let request = SourceRequest {
            source: Some(SocketEndpoint::port(8080)),
            destination: SocketEndpoint::pipe("/tmp/dest.sock"),
            environment_variable: Some("SSH_AUTH_SOCK".to_string()),
        };

        let response = f.handler.create_source(&request, None);

        assert!(response
            .error
            .as_deref()
            .unwrap()
            .contains("Do not set a source when forwarding named pipes"));
        assert!(f.network.listens().is_empty());
    }

    #[test]
    fn test_create_source_rejects_duplicate_endpoint() {
        let mut f = fixture();
        assert!(!f.handler.create_source(&port_forward(8080, 9090), None).is_error());

        let response = f.handler.create_source(&port_forward(8080, 9191), None);

        assert!(response.is_error());
        assert_eq!(f.handler.source_count(), 1);
        assert_eq!(f.network.listens().len(), 1);
    }

    #[test]
    fn test_create_source_listen_failure() {
        let mut f = fixture();
        f.network.fail_listen(SocketEndpoint::port(8080));

        let response = f.handler.create_source(&port_forward(8080, 9090), None);

        assert!(response.error.as_deref().unwrap().contains("Could not listen on *:8080"));
        assert_eq!(f.handler.source_count(), 0);
    }

    #[test]
    fn test_create_destination_prefers_ipv6() {
        let mut f = fixture();
        f.network.queue_connect(42);

        let response =
            f.handler.create_destination(&destination_request(SocketEndpoint::port(8080), 100));

        assert_eq!(response.client_fd, 100);
        assert!(!response.is_error());
        assert!(response.socket_id().is_some());
        assert_eq!(f.network.connects(), vec![SocketEndpoint::tcp("::1", 8080)]);
        assert_eq!(f.handler.destination_count(), 1);
    }

    #[test]
    fn test_create_destination_both_families_fail() {
        let mut f = fixture();

        let response =
            f.handler.create_destination(&destination_request(SocketEndpoint::port(8080), 100));

        assert_eq!(response.client_fd, 100);
        assert!(response.is_error());
        assert_eq!(response.socket_id(), None);
        assert_eq!(
            f.network.connects(),
            vec![
                SocketEndpoint::tcp("::1", 8080),
                SocketEndpoint::tcp("127.0.0.1", 8080)
            ]
        );
        assert_eq!(f.handler.destination_count(), 0);
    }

    #[test]
    fn test_create_destination_explicit_host() {
        let mut f = fixture();
        f.network.queue_connect(42);
        let destination = SocketEndpoint::tcp("db.internal", 5432);

        let response = f.handler.create_destination(&destination_request(destination.clone(), 7));

        assert!(!response.is_error());
        assert_eq!(f.network.connects(), vec![destination]);
    }

    #[test]
    fn test_create_destination_with_pipe() {
        let mut f = fixture();
        f.pipe.queue_connect(55);

        let response = f
            .handler
            .create_destination(&destination_request(SocketEndpoint::pipe("/tmp/test.sock"), 200));

        assert_eq!(response.client_fd, 200);
        assert!(!response.is_error());
        assert_eq!(f.pipe.connects(), vec![SocketEndpoint::pipe("/tmp/test.sock")]);
        assert!(f.network.connects().is_empty());
    }

    #[test]
    fn test_socket_ids_are_not_reused() {
        let mut f = fixture();
        f.network.queue_connect(42);
        f.network.queue_connect(43);

        let first = f
            .handler
            .create_destination(&destination_request(SocketEndpoint::port(8080), 1));
        handle(&mut f, &PortForwardData::closed(first.socket_id().unwrap(), true));
        let second = f
            .handler
            .create_destination(&destination_request(SocketEndpoint::port(8080), 2));

        assert_ne!(first.socket_id(), second.socket_id());
    }

    #[test]
    fn test_data_for_destination_is_written() {
        let mut f = fixture();
        f.network.queue_connect(42);
        let response =
            f.handler.create_destination(&destination_request(SocketEndpoint::port(8080), 100));
        let socket_id = response.socket_id().unwrap();

        handle(&mut f, &PortForwardData::buffer(socket_id, true, b"test data".to_vec()));

        assert_eq!(f.network.write_calls(42), vec![b"test data".to_vec()]);
    }

    #[test]
    fn test_closed_and_error_close_destination_once() {
        for terminal in [
            PortForwardData::closed(1, true),
            PortForwardData::error(1, true, "connection error"),
        ] {
            let mut f = fixture();
            f.network.queue_connect(42);
            let response =
                f.handler.create_destination(&destination_request(SocketEndpoint::port(8080), 100));
            assert_eq!(response.socket_id(), Some(1));

            handle(&mut f, &terminal);
            handle(&mut f, &terminal);
            handle(&mut f, &PortForwardData::buffer(1, true, b"late".to_vec()));

            assert_eq!(f.network.close_count(42), 1);
            assert!(f.network.written(42).is_empty());
            assert_eq!(f.handler.destination_count(), 0);
        }
    }

    #[test]
    fn test_destination_request_packet_gets_response() {
        let mut f = fixture();
        f.network.queue_connect(42);

        handle(&mut f, &destination_request(SocketEndpoint::port(8080), 100));

        let sent = f.connection.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::DestinationResponse);
        let response: DestinationResponse = sent[0].decode_message().unwrap();
        assert_eq!(response.client_fd, 100);
        assert!(!response.is_error());
    }

    #[test]
    fn test_destination_response_binds_pending_fd() {
        let mut f = fixture();
        pending_connection(&mut f);

        handle(&mut f, &DestinationResponse::connected(123, 456));
        handle(&mut f, &PortForwardData::buffer(456, false, b"test".to_vec()));

        assert_eq!(f.network.written(123), b"test".to_vec());
        assert_eq!(f.handler.pending_count(), 0);
        assert_eq!(f.handler.bound_count(), 1);
    }

    #[test]
    fn test_destination_response_error_closes_fd() {
        let mut f = fixture();
        pending_connection(&mut f);

        handle(&mut f, &DestinationResponse::failed(123, "connection failed"));

        assert_eq!(f.network.closed(), vec![123]);
        assert_eq!(f.handler.pending_count(), 0);
        assert_eq!(f.handler.bound_count(), 0);
    }

    #[test]
    fn test_late_destination_response_releases_peer_socket() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.handler.close_source_fd(123);

        handle(&mut f, &DestinationResponse::connected(123, 456));

        let sent = f.connection.take();
        assert_eq!(sent.len(), 1);
        let data: PortForwardData = sent[0].decode_message().unwrap();
        assert_eq!(data, PortForwardData::closed(456, true));
        assert_eq!(f.handler.bound_count(), 0);
    }

    #[test]
    fn test_destination_response_for_bound_fd_releases_peer_socket() {
        let mut f = fixture();
        pending_connection(&mut f);
        handle(&mut f, &DestinationResponse::connected(123, 456));

        handle(&mut f, &DestinationResponse::connected(123, 789));

        let sent = f.connection.take();
        assert_eq!(sent.len(), 1);
        let data: PortForwardData = sent[0].decode_message().unwrap();
        assert_eq!(data, PortForwardData::closed(789, true));
        assert!(f.network.closed().is_empty());
        assert_eq!(f.handler.bound_count(), 1);
    }

    #[test]
    fn test_destination_response_with_bound_socket_id_closes_pending_fd() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.network.queue_accept(FIRST_LISTEN_FD, 124);
        f.handler.update(&mut Vec::new(), &mut Vec::new());
        handle(&mut f, &DestinationResponse::connected(123, 456));

        handle(&mut f, &DestinationResponse::connected(124, 456));

        assert_eq!(f.network.closed(), vec![124]);
        assert_eq!(f.handler.pending_count(), 0);
        assert_eq!(f.handler.bound_count(), 1);
        // The id stays live for fd 123
        assert!(f.connection.take().is_empty());
        handle(&mut f, &PortForwardData::buffer(456, false, b"still here".to_vec()));
        assert_eq!(f.network.written(123), b"still here".to_vec());
    }

    #[test]
    fn test_close_source_fd_is_idempotent() {
        let mut f = fixture();
        pending_connection(&mut f);

        f.handler.close_source_fd(123);
        f.handler.close_source_fd(123);

        assert_eq!(f.network.closed(), vec![123]);
        assert_eq!(f.handler.pending_count(), 0);
    }

    #[test]
    fn test_close_source_fd_on_bound_stream() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.handler.add_source_socket_id(456, 123).unwrap();

        f.handler.close_source_fd(123);

        assert_eq!(f.network.closed(), vec![123]);
        assert_eq!(f.handler.bound_count(), 0);
    }

    #[test]
    fn test_add_source_socket_id_then_send() {
        let mut f = fixture();
        pending_connection(&mut f);

        f.handler.add_source_socket_id(456, 123).unwrap();
        f.handler.send_data_to_source_on_socket(456, b"X");

        assert_eq!(f.network.written(123), b"X".to_vec());
    }

    #[test]
    fn test_add_source_socket_id_never_overwrites() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.network.queue_accept(FIRST_LISTEN_FD, 124);
        f.handler.update(&mut Vec::new(), &mut Vec::new());
        f.handler.add_source_socket_id(456, 123).unwrap();

        assert!(matches!(
            f.handler.add_source_socket_id(456, 124),
            Err(HandlerError::SocketIdInUse(456))
        ));
        assert!(matches!(
            f.handler.add_source_socket_id(457, 123),
            Err(HandlerError::FdAlreadyBound(123))
        ));
        assert!(matches!(
            f.handler.add_source_socket_id(458, 999),
            Err(HandlerError::UnknownSourceFd(999))
        ));
        assert_eq!(f.handler.bound_count(), 1);
        assert_eq!(f.handler.pending_count(), 1);
    }

    #[test]
    fn test_close_source_socket_id_is_idempotent() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.handler.add_source_socket_id(456, 123).unwrap();

        f.handler.close_source_socket_id(456);
        f.handler.close_source_socket_id(456);

        assert_eq!(f.network.closed(), vec![123]);
    }

    #[test]
    fn test_send_to_unknown_socket_id_is_noop() {
        let mut f = fixture();
        pending_connection(&mut f);

        f.handler.send_data_to_source_on_socket(999, b"hello");

        assert!(f.network.written(123).is_empty());
        let mut data = Vec::new();
        f.handler.update(&mut Vec::new(), &mut data);
        assert!(data.is_empty());
    }

    #[test]
    fn test_source_write_failure_notifies_peer() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.handler.add_source_socket_id(456, 123).unwrap();
        f.network.fail_writes(123);

        f.handler.send_data_to_source_on_socket(456, b"hello");

        assert_eq!(f.network.closed(), vec![123]);
        let mut data = Vec::new();
        f.handler.update(&mut Vec::new(), &mut data);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].socket_id, 456);
        assert!(data[0].source_to_destination);
        assert!(matches!(data[0].payload, DataPayload::Error(_)));
    }

    #[test]
    fn test_destination_write_failure_notifies_peer() {
        let mut f = fixture();
        f.network.queue_connect(42);
        f.network.fail_writes(42);
        let socket_id = f
            .handler
            .create_destination(&destination_request(SocketEndpoint::port(8080), 100))
            .socket_id()
            .unwrap();

        handle(&mut f, &PortForwardData::buffer(socket_id, true, b"data".to_vec()));

        assert_eq!(f.handler.destination_count(), 0);
        let mut data = Vec::new();
        f.handler.update(&mut Vec::new(), &mut data);
        assert_eq!(data.len(), 1);
        assert!(!data[0].source_to_destination);
        assert!(data[0].is_terminal());
    }

    #[test]
    fn test_update_relays_destination_data() {
        let mut f = fixture();
        f.network.queue_connect(42);
        let socket_id = f
            .handler
            .create_destination(&destination_request(SocketEndpoint::port(8080), 100))
            .socket_id()
            .unwrap();
        f.network.queue_read(42, b"response");
        f.network.queue_eof(42);

        let mut data = Vec::new();
        f.handler.update(&mut Vec::new(), &mut data);

        assert_eq!(
            data,
            vec![
                PortForwardData::buffer(socket_id, false, b"response".to_vec()),
                PortForwardData::closed(socket_id, false),
            ]
        );
        assert_eq!(f.handler.destination_count(), 0);
        assert_eq!(f.network.closed(), vec![42]);
    }

    #[test]
    fn test_pending_timeout_expires_fd() {
        let network = Arc::new(FakeSocketHandler::new());
        let pipe = Arc::new(FakeSocketHandler::new());
        let config = HandlerConfig::default().with_pending_timeout(0);
        let mut handler = PortForwardHandler::new(network.clone(), pipe, config);
        handler.create_source(&port_forward(8080, 9090), None);
        network.queue_accept(FIRST_LISTEN_FD, 123);

        let mut requests = Vec::new();
        handler.update(&mut requests, &mut Vec::new());
        assert_eq!(requests.len(), 1);
        assert_eq!(handler.pending_count(), 1);

        handler.update(&mut Vec::new(), &mut Vec::new());
        assert_eq!(handler.pending_count(), 0);
        assert_eq!(network.closed(), vec![123]);
    }

    #[test]
    fn test_source_request_packet_creates_rule() {
        let mut f = fixture();

        handle(&mut f, &port_forward(8080, 9090));

        assert_eq!(f.handler.source_count(), 1);
        let sent = f.connection.take();
        assert_eq!(sent[0].packet_type, PacketType::SourceResponse);
        let response: SourceResponse = sent[0].decode_message().unwrap();
        assert!(!response.is_error());
    }

    #[test]
    fn test_source_response_packet_is_surfaced() {
        let mut f = fixture();
        let event = handle(&mut f, &SourceResponse::error("port in use"));
        assert_eq!(
            event,
            Some(HandlerEvent::SourceResponse(SourceResponse::error("port in use")))
        );
        assert!(f.connection.is_empty());
    }

    #[test]
    fn test_malformed_packet_is_an_error() {
        let mut f = fixture();
        let packet = Packet::new(PacketType::Data, bytes::Bytes::from_static(&[0xff]));
        assert!(matches!(
            f.handler.handle_packet(&packet, &f.connection),
            Err(HandlerError::Proto(_))
        ));
    }

    #[test]
    fn test_remove_source() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.handler.add_source_socket_id(456, 123).unwrap();

        assert!(f.handler.remove_source(&SocketEndpoint::port(8080)));
        assert!(!f.handler.remove_source(&SocketEndpoint::port(8080)));

        assert_eq!(f.network.closed(), vec![123]);
        assert_eq!(f.network.stopped(), vec![SocketEndpoint::port(8080)]);
        let mut data = Vec::new();
        f.handler.update(&mut Vec::new(), &mut data);
        assert_eq!(data, vec![PortForwardData::closed(456, true)]);
    }

    #[test]
    fn test_close_all() {
        let mut f = fixture();
        pending_connection(&mut f);
        f.network.queue_connect(42);
        f.handler
            .create_destination(&destination_request(SocketEndpoint::port(22), 9));

        f.handler.close_all();

        let mut closed = f.network.closed();
        closed.sort_unstable();
        assert_eq!(closed, vec![42, 123]);
        assert_eq!(f.network.stopped(), vec![SocketEndpoint::port(8080)]);
        assert_eq!(f.handler.source_count(), 0);
        assert_eq!(f.handler.destination_count(), 0);
    }
}
