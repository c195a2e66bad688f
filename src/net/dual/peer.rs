//! Per-peer connection state: the endpoint the transport tracks for one
//! remote across both channels, plus its dedicated writer task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::types::Channel;

use super::error::{Disconnect, DisconnectReason, NetError};
use super::event::DualEvent;
use super::frame;
use super::packet::Packet;
use super::socket::Inner;

/// Lifecycle state of a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// Client side: stream dial in progress.
    Connecting = 0,
    /// Listener side: accepted, waiting for the host application's
    /// accept/deny decision.
    AcceptPending = 1,
    /// Client side: waiting for the listener's status reply.
    AwaitingStatus = 2,
    /// Listener side: accepted, waiting for the client's datagram port.
    AwaitingPeerInfo = 3,
    /// Both channels established on both ends.
    Connected = 4,
    /// Graceful teardown in progress.
    Disconnecting = 5,
    /// Torn down; the peer is out of both registries.
    Closed = 6,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::AcceptPending,
            2 => Self::AwaitingStatus,
            3 => Self::AwaitingPeerInfo,
            4 => Self::Connected,
            5 => Self::Disconnecting,
            _ => Self::Closed,
        }
    }
}

/// Elapsed-time accumulators for one channel, advanced by the monitor tick
/// and reset by the receive loops. Kept atomic so the cross-task reset is
/// an explicit design choice rather than an accidental race.
#[derive(Default)]
pub(crate) struct ChannelTimers {
    timeout_ms: AtomicU64,
    heartbeat_ms: AtomicU64,
}

impl ChannelTimers {
    /// Any traffic on the channel proves the connection is alive.
    pub(crate) fn reset_timeout(&self) {
        self.timeout_ms.store(0, Ordering::Relaxed);
    }

    /// Non-heartbeat traffic makes an outgoing heartbeat unnecessary.
    pub(crate) fn reset_heartbeat(&self) {
        self.heartbeat_ms.store(0, Ordering::Relaxed);
    }

    pub(crate) fn advance(&self, elapsed_ms: u64) {
        self.timeout_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.heartbeat_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self, limit: Duration) -> bool {
        self.timeout_ms.load(Ordering::Relaxed) >= limit.as_millis() as u64
    }

    pub(crate) fn heartbeat_due(&self, interval: Duration) -> bool {
        self.heartbeat_ms.load(Ordering::Relaxed) >= interval.as_millis() as u64
    }
}

/// Work items for a peer's writer task. One writer per peer means no two
/// sends against the same peer ever race, on either channel.
pub(crate) enum Outbound {
    /// A framed application packet.
    Packet { packet: Packet, channel: Channel },
    /// A zero-length liveness frame. Send failures are reported but do
    /// not tear the connection down.
    Heartbeat(Channel),
    /// A raw handshake integer (status reply or datagram port), written
    /// to the stream before framing begins.
    Handshake(i32),
    /// Write the optional goodbye, then tear the peer down and stop.
    Shutdown {
        wire: Option<ShutdownWire>,
        event: Disconnect,
    },
}

/// What a shutdown puts on the wire before the socket is released.
pub(crate) enum ShutdownWire {
    /// Raw handshake status (listener denying a request).
    Status(i32),
    /// Control code, optionally followed by a framed message packet.
    Control {
        reason: DisconnectReason,
        message: Option<Packet>,
    },
}

/// The transport's representation of one connected remote across both
/// channels.
pub struct Peer {
    tcp_addr: SocketAddr,
    udp_addr: OnceLock<SocketAddr>,
    state: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<Outbound>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    pub(crate) reliable_timers: ChannelTimers,
    pub(crate) unreliable_timers: ChannelTimers,
}

impl Peer {
    /// Splits the accepted/dialed stream, spawns the writer task, and
    /// stashes the read half for the handshake driver.
    pub(crate) fn launch(
        inner: &Arc<Inner>,
        stream: TcpStream,
        udp: Arc<UdpSocket>,
        state: PeerState,
    ) -> std::io::Result<Arc<Self>> {
        let tcp_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let peer = Arc::new(Self {
            tcp_addr,
            udp_addr: OnceLock::new(),
            state: AtomicU8::new(state as u8),
            closed: AtomicBool::new(false),
            cancel: inner.cancel_token().child_token(),
            outbound: tx,
            read_half: Mutex::new(Some(read_half)),
            writer: Mutex::new(None),
            reliable_timers: ChannelTimers::default(),
            unreliable_timers: ChannelTimers::default(),
        });

        let handle = tokio::spawn(writer_loop(
            Arc::clone(inner),
            Arc::clone(&peer),
            write_half,
            udp,
            rx,
        ));
        *peer.writer.lock().unwrap() = Some(handle);

        Ok(peer)
    }

    /// The peer's stream-channel address. This is the canonical identity:
    /// the datagram address is discovered through it.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// The peer's datagram-channel address, known only after the
    /// handshake's port exchange.
    #[inline]
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr.get().copied()
    }

    pub(crate) fn set_udp_addr(&self, addr: SocketAddr) {
        let _ = self.udp_addr.set(addr);
    }

    #[inline]
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// First caller wins; the teardown sequence runs exactly once.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn queue(&self, item: Outbound) -> Result<(), NetError> {
        self.outbound.send(item).map_err(|_| NetError::NotConnected)
    }

    pub(crate) fn take_read_half(&self) -> Option<OwnedReadHalf> {
        self.read_half.lock().unwrap().take()
    }

    pub(crate) fn take_writer_handle(&self) -> Option<JoinHandle<()>> {
        self.writer.lock().unwrap().take()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.tcp_addr)
            .field("udp_addr", &self.udp_addr.get())
            .field("state", &self.state())
            .finish()
    }
}

/// Single writer per peer: every outbound byte for this peer, on either
/// channel, is issued from here in queue order.
async fn writer_loop(
    inner: Arc<Inner>,
    peer: Arc<Peer>,
    mut tcp: OwnedWriteHalf,
    udp: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        let item = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            Outbound::Packet { packet, channel } => {
                let result = match channel {
                    Channel::Reliable => tcp.write_all(packet.framed()).await,
                    Channel::Unreliable => match peer.udp_addr() {
                        Some(addr) => udp.send_to(packet.framed(), addr).await.map(|_| ()),
                        None => {
                            warn!(peer = %peer.addr(), "dropping unreliable send, datagram address not yet exchanged");
                            Ok(())
                        }
                    },
                };
                if let Err(err) = result {
                    if !peer.cancel.is_cancelled() {
                        inner.push_event(DualEvent::NetworkError(
                            Some(Arc::clone(&peer)),
                            NetError::Io(err),
                        ));
                        inner.teardown(&peer, Disconnect::new(DisconnectReason::SocketError));
                    }
                    break;
                }
            }
            Outbound::Heartbeat(channel) => {
                trace!(peer = %peer.addr(), ?channel, "heartbeat");
                let bytes = frame::heartbeat_bytes();
                let result = match channel {
                    Channel::Reliable => tcp.write_all(&bytes).await,
                    Channel::Unreliable => match peer.udp_addr() {
                        Some(addr) => udp.send_to(&bytes, addr).await.map(|_| ()),
                        None => Ok(()),
                    },
                };
                // A failed heartbeat is reported but the liveness monitor
                // decides when the connection is actually gone.
                if let Err(err) = result {
                    if !peer.cancel.is_cancelled() {
                        inner.push_event(DualEvent::NetworkError(
                            Some(Arc::clone(&peer)),
                            NetError::Io(err),
                        ));
                    }
                }
            }
            Outbound::Handshake(value) => {
                if let Err(err) = tcp.write_all(&value.to_le_bytes()).await {
                    if !peer.cancel.is_cancelled() {
                        inner.push_event(DualEvent::NetworkError(
                            Some(Arc::clone(&peer)),
                            NetError::Io(err),
                        ));
                        inner.teardown(&peer, Disconnect::new(DisconnectReason::SocketError));
                    }
                    break;
                }
            }
            Outbound::Shutdown { wire, mut event } => {
                // Best effort: the peer may already be gone.
                match wire {
                    Some(ShutdownWire::Status(status)) => {
                        let _ = tcp.write_all(&status.to_le_bytes()).await;
                    }
                    Some(ShutdownWire::Control { reason, message }) => {
                        let _ = tcp.write_all(&frame::control_bytes(reason.code())).await;
                        if let Some(message) = message {
                            let _ = tcp.write_all(message.framed()).await;
                            // The local disconnected event carries the same
                            // message the remote will see.
                            event.message = Some(message);
                        }
                    }
                    None => {}
                }
                let _ = tcp.flush().await;
                debug!(peer = %peer.addr(), reason = ?event.reason, "peer shut down");
                inner.teardown(&peer, event);
                break;
            }
        }
    }
}
