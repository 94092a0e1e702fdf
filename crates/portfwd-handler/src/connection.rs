//! Session channel seen by the handler

use crate::ConnectionError;
use portfwd_proto::Packet;
use std::cell::RefCell;

/// Ordered, reliable packet sink towards the peer
pub trait Connection {
    fn write_packet(&self, packet: Packet) -> Result<(), ConnectionError>;
}

/// Connection that keeps written packets in memory
///
/// Useful for driving a handler without a transport, e.g. to relay packets
/// between two handlers in the same process.
#[derive(Debug, Default)]
pub struct BufferedConnection {
    packets: RefCell<Vec<Packet>>,
}

impl BufferedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything written so far
    pub fn take(&self) -> Vec<Packet> {
        self.packets.take()
    }

    pub fn len(&self) -> usize {
        self.packets.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.borrow().is_empty()
    }
}

impl Connection for BufferedConnection {
    fn write_packet(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.packets.borrow_mut().push(packet);
        Ok(())
    }
}
