//! The event drain queue and the events it delivers.
//!
//! Every loop-task completion is enqueued here instead of invoking user
//! code directly. The host drains the queue once per tick through
//! [`DualSocket::pump`](super::socket::DualSocket::pump), receiving events
//! in FIFO order with no two callbacks ever running concurrently.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::Channel;

use super::error::{Disconnect, DisconnectReason, NetError};
use super::handshake;
use super::packet::Packet;
use super::peer::{Outbound, Peer, ShutdownWire};
use super::socket::Inner;

/// A network event drained from the queue.
#[derive(Debug)]
pub enum DualEvent {
    /// A client wants to connect (listener mode only). Resolve it with
    /// [`ConnectRequest::accept`] or [`ConnectRequest::deny`].
    ConnectionRequest(ConnectRequest),
    /// The handshake completed on both channels.
    Connected(Arc<Peer>),
    /// The peer is gone; it has already been removed from both registries.
    Disconnected(Arc<Peer>, Disconnect),
    /// An application packet arrived.
    Packet(Arc<Peer>, Packet, Channel),
    /// An OS-level socket fault. Cancellation during shutdown is never
    /// reported here.
    NetworkError(Option<Arc<Peer>>, NetError),
}

/// A pending connection surfaced to the host application for an
/// accept/deny decision.
pub struct ConnectRequest {
    pub(crate) peer: Arc<Peer>,
    pub(crate) inner: Arc<Inner>,
}

impl ConnectRequest {
    /// Address of the connecting client.
    pub fn addr(&self) -> SocketAddr {
        self.peer.addr()
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Accepts the connection: replies with the accept status and finishes
    /// the handshake (datagram port exchange) in the background.
    pub fn accept(self) {
        debug!(peer = %self.peer.addr(), "connection request accepted");
        let inner = Arc::clone(&self.inner);
        inner.spawn(handshake::finish_accept(self.inner, self.peer));
    }

    /// Denies the connection: replies with the deny status and tears the
    /// pending peer down with a rejected reason.
    pub fn deny(self) {
        debug!(peer = %self.peer.addr(), "connection request denied");
        let _ = self.peer.queue(Outbound::Shutdown {
            wire: Some(ShutdownWire::Status(handshake::STATUS_DENY)),
            event: Disconnect::new(DisconnectReason::ConnectionRejected),
        });
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("addr", &self.peer.addr())
            .finish()
    }
}

/// Single-consumer queue serializing all user-visible callbacks.
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<DualEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<DualEvent>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub(crate) fn push(&self, event: DualEvent) {
        // The receiver lives as long as the queue; a failed send only
        // happens during final teardown and is safe to drop.
        let _ = self.tx.send(event);
    }

    /// Drains every queued event in FIFO order.
    pub(crate) fn drain(&self) -> Vec<DualEvent> {
        let mut rx = self.rx.lock().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
