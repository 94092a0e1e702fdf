//! One port-forward session over a packet stream

use crate::transport::{PacketReceiver, PacketSender, PacketTransport};
use crate::{SessionConfig, SessionError};
use portfwd_handler::{Connection, HandlerConfig, HandlerError, HandlerEvent, PortForwardHandler};
use portfwd_proto::{Packet, SourceRequest};
use portfwd_socket::{PipeSocketHandler, TcpSocketHandler};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler backed by the real TCP and unix-socket facilities
pub fn local_handler(config: &HandlerConfig) -> PortForwardHandler {
    PortForwardHandler::new(
        Arc::new(TcpSocketHandler::new()),
        Arc::new(PipeSocketHandler::new()),
        config.clone(),
    )
}

pub struct Session<T> {
    id: String,
    handler: PortForwardHandler,
    transport: PacketTransport<T>,
    poll_interval: Duration,
    forward: Vec<SourceRequest>,
    reverse: Vec<SourceRequest>,
    events: Option<mpsc::UnboundedSender<HandlerEvent>>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Session using local sockets and the tunnels listed in `config`
    pub fn new(io: T, config: &SessionConfig) -> Result<Self, SessionError> {
        let forward = config.forward_requests()?;
        let reverse = config.reverse_requests()?;
        Ok(
            Self::with_handler(io, local_handler(&config.handler), config.poll_interval())
                .with_tunnels(forward, reverse),
        )
    }

    /// Session that only answers the peer's requests
    pub fn with_handler(io: T, handler: PortForwardHandler, poll_interval: Duration) -> Self {
        Self {
            id: format!("session-{}", uuid::Uuid::new_v4()),
            handler,
            transport: PacketTransport::new(io),
            poll_interval,
            forward: Vec::new(),
            reverse: Vec::new(),
            events: None,
        }
    }

    /// Forward tunnels listen locally; reverse tunnels are requested from the peer
    pub fn with_tunnels(mut self, forward: Vec<SourceRequest>, reverse: Vec<SourceRequest>) -> Self {
        self.forward = forward;
        self.reverse = reverse;
        self
    }

    /// Receive handler events (the peer's answers to reverse tunnels)
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<HandlerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the session until the peer hangs up, `shutdown` resolves or
    /// the transport fails. Every forwarded socket is closed on return.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let span = info_span!("session", id = %self.id);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner<F>(self, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let Session {
            mut handler,
            transport,
            poll_interval,
            forward,
            reverse,
            events,
            ..
        } = self;
        let PacketTransport {
            sender,
            mut receiver,
            writer,
        } = transport;

        let result = match start(&mut handler, &sender, &forward, &reverse) {
            Ok(()) => {
                drive(
                    &mut handler,
                    &sender,
                    &mut receiver,
                    poll_interval,
                    events.as_ref(),
                    shutdown,
                )
                .await
            }
            Err(e) => Err(e),
        };

        handler.close_all();
        drop(sender);
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Packet writer task failed: {}", e),
            Err(_) => warn!("Timed out flushing packets to the peer"),
        }
        info!("Session ended");
        result
    }
}

fn start(
    handler: &mut PortForwardHandler,
    sender: &PacketSender,
    forward: &[SourceRequest],
    reverse: &[SourceRequest],
) -> Result<(), SessionError> {
    for request in forward {
        let owner = handler.config().pipe_owner;
        let response = handler.create_source(request, owner);
        if let Some(reason) = response.error {
            return Err(SessionError::Rejected(reason));
        }
        if let Some(name) = response.source_name {
            info!(
                "{}={}",
                request.environment_variable.as_deref().unwrap_or_default(),
                name
            );
        } else if let Some(source) = &request.source {
            info!("Forwarding {} -> {}", source, request.destination);
        }
    }

    for request in reverse {
        info!("Requesting reverse forward to {}", request.destination);
        sender.write_packet(Packet::from_message(request)?)?;
    }
    Ok(())
}

async fn drive<T, F>(
    handler: &mut PortForwardHandler,
    sender: &PacketSender,
    receiver: &mut PacketReceiver<T>,
    poll_interval: Duration,
    events: Option<&mpsc::UnboundedSender<HandlerEvent>>,
    shutdown: F,
) -> Result<(), SessionError>
where
    T: AsyncRead,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down session");
                return Ok(());
            }
            _ = ticker.tick() => poll(handler, sender)?,
            packet = receiver.recv() => match packet {
                Ok(Some(packet)) => handle(handler, sender, &packet, events)?,
                Ok(None) => {
                    info!("Peer closed the session");
                    return Ok(());
                }
                Err(SessionError::Proto(e)) => warn!("Dropping malformed packet: {}", e),
                Err(e) => return Err(e),
            },
        }
    }
}

/// One update tick: new connections become destination requests, socket
/// data becomes data messages
fn poll(handler: &mut PortForwardHandler, sender: &PacketSender) -> Result<(), SessionError> {
    let mut requests = Vec::new();
    let mut data = Vec::new();
    handler.update(&mut requests, &mut data);

    for request in &requests {
        sender.write_packet(Packet::from_message(request)?)?;
    }
    for message in &data {
        sender.write_packet(Packet::from_message(message)?)?;
    }
    Ok(())
}

fn handle(
    handler: &mut PortForwardHandler,
    sender: &PacketSender,
    packet: &Packet,
    events: Option<&mpsc::UnboundedSender<HandlerEvent>>,
) -> Result<(), SessionError> {
    match handler.handle_packet(packet, sender) {
        Ok(Some(event)) => {
            let HandlerEvent::SourceResponse(response) = &event;
            let rejected = response.error.clone();
            if let Some(events) = events {
                if events.send(event).is_err() {
                    debug!("No subscriber left for handler events");
                }
            }
            match rejected {
                Some(reason) => Err(SessionError::Rejected(reason)),
                None => Ok(()),
            }
        }
        Ok(None) => Ok(()),
        Err(HandlerError::Connection(e)) => Err(e.into()),
        Err(e) => {
            warn!("Ignoring {:?} packet: {}", packet.packet_type, e);
            Ok(())
        }
    }
}
