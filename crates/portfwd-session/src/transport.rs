//! Length-delimited packet framing over an async byte stream

use crate::SessionError;
use futures::{SinkExt, StreamExt};
use portfwd_handler::{Connection, ConnectionError};
use portfwd_proto::Packet;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error};

/// Upper bound on one framed packet
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Packet stream split into a synchronous sender and an async receiver
pub struct PacketTransport<T> {
    pub sender: PacketSender,
    pub receiver: PacketReceiver<T>,
    pub writer: JoinHandle<()>,
}

impl<T> PacketTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(FramedWrite::new(write_half, codec()), rx));

        Self {
            sender: PacketSender { tx },
            receiver: PacketReceiver {
                frames: FramedRead::new(read_half, codec()),
            },
            writer,
        }
    }
}

/// Queues packets for the writer task, in order
#[derive(Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketSender {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Connection for PacketSender {
    fn write_packet(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.tx.send(packet).map_err(|_| ConnectionError::Closed)
    }
}

pub struct PacketReceiver<T> {
    frames: FramedRead<ReadHalf<T>, LengthDelimitedCodec>,
}

impl<T: AsyncRead> PacketReceiver<T> {
    /// Next packet from the peer, `None` once the stream ends
    pub async fn recv(&mut self) -> Result<Option<Packet>, SessionError> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(Some(Packet::decode(frame.freeze())?)),
            Some(Err(e)) => Err(SessionError::Io(e)),
            None => Ok(None),
        }
    }
}

async fn writer_task<T: AsyncWrite>(
    mut sink: FramedWrite<WriteHalf<T>, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<Packet>,
) {
    while let Some(packet) = rx.recv().await {
        if let Err(e) = sink.send(packet.encode()).await {
            error!("Failed to write packet: {}", e);
            break;
        }
    }
    if let Err(e) = SinkExt::<tokio_util::bytes::Bytes>::close(&mut sink).await {
        debug!("Error closing packet stream: {}", e);
    }
    debug!("Packet writer task ended");
}
