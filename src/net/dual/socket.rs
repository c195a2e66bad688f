//! The dual-channel socket: public surface, lifecycle, and the socket I/O
//! loops.
//!
//! All socket work happens on background tasks: one stream receive loop
//! per peer, one shared datagram receive loop, one accept loop in listener
//! mode, and one heartbeat ticker. They never call user code directly:
//! everything user-visible funnels through the event drain queue and is
//! delivered by [`DualSocket::pump`].

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{Channel, SocketMode};

use super::config::{ChannelSettings, SocketConfig};
use super::error::{Disconnect, DisconnectReason, NetError};
use super::event::{ConnectRequest, DualEvent, EventQueue};
use super::frame::{self, DatagramFrame, FrameAccumulator, StreamFrame};
use super::handshake;
use super::monitor;
use super::packet::{Packet, LENGTH_PREFIX};
use super::peer::{Outbound, Peer, PeerState, ShutdownWire};
use super::pool::BufferPool;
use super::table::PeerTable;

/// Shared core behind every [`DualSocket`] handle and loop task.
pub(crate) struct Inner {
    pub(crate) config: SocketConfig,
    pub(crate) table: PeerTable,
    pub(crate) events: EventQueue,
    pub(crate) pool: Arc<BufferPool>,
    running: AtomicBool,
    mode: Mutex<Option<SocketMode>>,
    cancel: Mutex<CancellationToken>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
}

impl Inner {
    pub(crate) fn new(config: SocketConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: PeerTable::default(),
            events: EventQueue::new(),
            pool: BufferPool::new(),
            running: AtomicBool::new(false),
            mode: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            udp: Mutex::new(None),
            local_addr: Mutex::new(None),
            runtime: Mutex::new(None),
        })
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    pub(crate) fn settings(&self, channel: Channel) -> &ChannelSettings {
        match channel {
            Channel::Reliable => &self.config.reliable,
            Channel::Unreliable => &self.config.unreliable,
        }
    }

    pub(crate) fn push_event(&self, event: DualEvent) {
        self.events.push(event);
    }

    /// Spawns a loop task on the runtime the socket was started under, so
    /// request resolution may be called from a non-async host tick.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.lock().unwrap().clone();
        match handle {
            Some(handle) => {
                handle.spawn(future);
            }
            None => {
                tokio::spawn(future);
            }
        }
    }

    /// Destroys a peer exactly once: removes it from both registries,
    /// stops its loops, and queues the disconnected event. Safe to race
    /// from any path.
    pub(crate) fn teardown(&self, peer: &Arc<Peer>, disconnect: Disconnect) {
        if peer.mark_closed() {
            return;
        }
        peer.set_state(PeerState::Closed);
        self.table.remove(peer);
        peer.cancel_token().cancel();
        debug!(peer = %peer.addr(), reason = ?disconnect.reason, "peer disconnected");
        self.push_event(DualEvent::Disconnected(Arc::clone(peer), disconnect));
    }
}

/// A dual-channel transport handle.
///
/// Cheap to clone; every clone refers to the same socket. Constructed and
/// owned explicitly (there is no global instance) and handed to
/// collaborators that need to send or pump.
#[derive(Clone)]
pub struct DualSocket {
    inner: Arc<Inner>,
}

impl DualSocket {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            inner: Inner::new(config),
        }
    }

    /// Client mode: dials the configured remote over the stream channel,
    /// binds a datagram socket to an ephemeral local port, and drives the
    /// handshake in the background. The connected (or disconnected) event
    /// arrives through [`DualSocket::pump`].
    pub async fn connect(&self) -> Result<(), NetError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }
        match self.start_client().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn start_client(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        let address = inner.config.address.ok_or_else(|| {
            NetError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client configuration requires a remote address",
            ))
        })?;
        let remote = SocketAddr::new(address, inner.config.port);

        let cancel = CancellationToken::new();
        *inner.cancel.lock().unwrap() = cancel.clone();
        *inner.mode.lock().unwrap() = Some(SocketMode::Client);
        *inner.runtime.lock().unwrap() = Some(tokio::runtime::Handle::current());

        // The datagram socket gets an ephemeral port; its number is sent
        // to the listener during the handshake.
        let udp_bind: SocketAddr = match remote.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let udp = Arc::new(UdpSocket::bind(udp_bind).await?);
        let local_udp_port = udp.local_addr()?.port();

        let stream = TcpStream::connect(remote).await?;
        info!(%remote, "stream channel open, awaiting handshake status");

        let peer = Peer::launch(inner, stream, Arc::clone(&udp), PeerState::Connecting)?;
        // The listener's datagram channel lives on the same port as its
        // stream listener, so the address is known up front.
        peer.set_udp_addr(remote);
        let read = peer.take_read_half().ok_or(NetError::NotConnected)?;

        *inner.udp.lock().unwrap() = Some(Arc::clone(&udp));

        inner.spawn(udp_recv_loop(
            Arc::clone(inner),
            udp,
            cancel.child_token(),
        ));
        inner.spawn(monitor::run(Arc::clone(inner), cancel.child_token()));
        inner.spawn(handshake::run_client(
            Arc::clone(inner),
            peer,
            read,
            local_udp_port,
        ));
        Ok(())
    }

    /// Listener mode: binds both channels on the configured port and
    /// starts accepting. Each incoming connection surfaces a
    /// [`ConnectRequest`] through [`DualSocket::pump`].
    pub async fn listen(&self) -> Result<(), NetError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }
        match self.start_listener().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn start_listener(&self) -> Result<(), NetError> {
        let inner = &self.inner;

        let cancel = CancellationToken::new();
        *inner.cancel.lock().unwrap() = cancel.clone();
        *inner.mode.lock().unwrap() = Some(SocketMode::Listener);
        *inner.runtime.lock().unwrap() = Some(tokio::runtime::Handle::current());

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, inner.config.port));
        let tcp = TcpSocket::new_v4()?;
        tcp.set_reuseaddr(true)?;
        tcp.bind(bind_addr)?;
        let listener = tcp.listen(inner.config.backlog)?;
        let local = listener.local_addr()?;

        // Both channels share one port; with port 0 the datagram socket
        // follows whatever the stream listener was assigned.
        let udp = Arc::new(UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local.port()))).await?);

        *inner.udp.lock().unwrap() = Some(Arc::clone(&udp));
        *inner.local_addr.lock().unwrap() = Some(local);
        info!(addr = %local, "listening on both channels");

        inner.spawn(accept_loop(
            Arc::clone(inner),
            listener,
            Arc::clone(&udp),
            cancel.child_token(),
        ));
        inner.spawn(udp_recv_loop(
            Arc::clone(inner),
            udp,
            cancel.child_token(),
        ));
        inner.spawn(monitor::run(Arc::clone(inner), cancel.child_token()));
        Ok(())
    }

    /// Creates an empty packet for the given channel, sized to its
    /// configured maximum, backed by the socket's buffer pool.
    pub fn new_packet(&self, channel: Channel) -> Packet {
        let capacity = self.inner.settings(channel).max_packet_size;
        Packet::new(&self.inner.pool, channel, capacity)
    }

    /// Queues a packet for the peer on the given channel.
    ///
    /// Oversize packets fail here, before touching the socket. Accepted
    /// packets are framed and issued by the peer's writer task in queue
    /// order.
    pub fn send(&self, peer: &Arc<Peer>, mut packet: Packet, channel: Channel) -> Result<(), NetError> {
        if packet.channel() != channel {
            return Err(NetError::ChannelMismatch {
                packet: packet.channel(),
                requested: channel,
            });
        }
        let limit = self.inner.settings(channel).max_packet_size;
        if packet.len() > limit {
            return Err(NetError::OversizePacket {
                channel,
                size: packet.len(),
                limit,
            });
        }
        if !self.inner.table.contains(peer) {
            return Err(NetError::NotConnected);
        }
        packet.insert_length();
        peer.queue(Outbound::Packet { packet, channel })
    }

    /// Gracefully disconnects: the peer is notified with a control code
    /// before the sockets are released.
    pub fn disconnect(&self, peer: &Arc<Peer>) {
        peer.set_state(PeerState::Disconnecting);
        let _ = peer.queue(Outbound::Shutdown {
            wire: Some(ShutdownWire::Control {
                reason: DisconnectReason::ConnectionClosed,
                message: None,
            }),
            event: Disconnect::new(DisconnectReason::ConnectionClosed),
        });
    }

    /// Gracefully disconnects with an application message the remote
    /// receives attached to its disconnected event. The message must be a
    /// reliable-channel packet.
    pub fn disconnect_with(&self, peer: &Arc<Peer>, mut message: Packet) -> Result<(), NetError> {
        if message.channel() != Channel::Reliable {
            return Err(NetError::ChannelMismatch {
                packet: message.channel(),
                requested: Channel::Reliable,
            });
        }
        let limit = self.inner.config.reliable.max_packet_size;
        if message.len() > limit {
            return Err(NetError::OversizePacket {
                channel: Channel::Reliable,
                size: message.len(),
                limit,
            });
        }
        message.insert_length();
        peer.set_state(PeerState::Disconnecting);
        peer.queue(Outbound::Shutdown {
            wire: Some(ShutdownWire::Control {
                reason: DisconnectReason::ConnectionClosedWithMessage,
                message: Some(message),
            }),
            event: Disconnect::new(DisconnectReason::ConnectionClosedWithMessage),
        })
    }

    /// Releases the peer immediately without notifying it.
    pub fn disconnect_forcefully(&self, peer: &Arc<Peer>) {
        self.inner.teardown(
            peer,
            Disconnect::new(DisconnectReason::ConnectionClosedForcefully),
        );
    }

    /// Shuts the whole socket down: disconnects every peer (notifying
    /// them when asked), stops all loops, and releases both sockets. The
    /// socket may be started again afterwards.
    pub async fn close(&self, notify_peers: bool) {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }

        let peers = inner.table.peers();
        for peer in &peers {
            if notify_peers {
                peer.set_state(PeerState::Disconnecting);
                let _ = peer.queue(Outbound::Shutdown {
                    wire: Some(ShutdownWire::Control {
                        reason: DisconnectReason::ConnectionClosed,
                        message: None,
                    }),
                    event: Disconnect::new(DisconnectReason::ConnectionClosed),
                });
            } else {
                inner.teardown(peer, Disconnect::new(DisconnectReason::ConnectionClosed));
            }
        }
        // Let each writer flush its goodbye and finish the teardown before
        // the global token stops the remaining loops.
        for peer in &peers {
            if let Some(handle) = peer.take_writer_handle() {
                let _ = handle.await;
            }
        }

        inner.cancel.lock().unwrap().cancel();
        *inner.udp.lock().unwrap() = None;
        *inner.local_addr.lock().unwrap() = None;
        *inner.mode.lock().unwrap() = None;
        inner.running.store(false, Ordering::SeqCst);
        info!("socket closed");
    }

    /// Drains all pending events in FIFO order. Call once per host tick;
    /// this is the only place user-visible events are delivered, so no
    /// two callbacks ever run concurrently.
    pub fn pump(&self) -> Vec<DualEvent> {
        self.inner.events.drain()
    }

    /// Role the socket is currently running in.
    pub fn mode(&self) -> Option<SocketMode> {
        *self.inner.mode.lock().unwrap()
    }

    /// Stream-channel address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.table.peers()
    }
}

impl std::fmt::Debug for DualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualSocket")
            .field("mode", &self.mode())
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Listener mode: accepts stream connections and surfaces a request for
/// each. A fault on one accept never stops the loop.
async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "incoming connection");
                match Peer::launch(&inner, stream, Arc::clone(&udp), PeerState::AcceptPending) {
                    Ok(peer) => {
                        inner.push_event(DualEvent::ConnectionRequest(ConnectRequest {
                            peer,
                            inner: Arc::clone(&inner),
                        }));
                    }
                    Err(err) => {
                        inner.push_event(DualEvent::NetworkError(None, NetError::Io(err)));
                    }
                }
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                inner.push_event(DualEvent::NetworkError(None, NetError::Io(err)));
            }
        }
    }
}

/// How a stream receive attempt ended without producing a frame.
enum StreamEnd {
    /// Cancelled by disconnect or shutdown; expected, never reported.
    Cancelled,
    /// Zero-byte read: the peer released its socket without notice.
    PeerVanished,
    /// Genuine socket fault.
    Io(io::Error),
    /// A declared length the channel settings reject.
    Violation(DisconnectReason),
}

/// Reads until the accumulator yields one complete frame, renting a fresh
/// receive buffer per read and retaining leftover bytes for the next
/// frame.
async fn next_stream_frame(
    pool: &Arc<BufferPool>,
    buffer_size: usize,
    peer: &Arc<Peer>,
    read: &mut OwnedReadHalf,
    acc: &mut FrameAccumulator,
) -> Result<StreamFrame, StreamEnd> {
    loop {
        match acc.next() {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => {}
            Err(reason) => return Err(StreamEnd::Violation(reason)),
        }

        let mut buf = pool.rent(buffer_size);
        buf.get_mut().resize(buffer_size, 0);
        let n = tokio::select! {
            _ = peer.cancel_token().cancelled() => return Err(StreamEnd::Cancelled),
            result = read.read(buf.get_mut().as_mut_slice()) => match result {
                Ok(0) => return Err(StreamEnd::PeerVanished),
                Ok(n) => n,
                Err(err) => return Err(StreamEnd::Io(err)),
            },
        };
        acc.extend(&buf.get()[..n]);
    }
}

/// Per-peer stream receive loop. Accumulates bytes across partial reads,
/// classifies each length prefix, and feeds payloads into the drain
/// queue. Runs until the peer disconnects.
pub(crate) async fn stream_recv_loop(inner: Arc<Inner>, peer: Arc<Peer>, mut read: OwnedReadHalf) {
    let buffer_size = inner.config.reliable.buffer_size;
    let mut acc = FrameAccumulator::new(&inner.config.reliable);

    loop {
        match next_stream_frame(&inner.pool, buffer_size, &peer, &mut read, &mut acc).await {
            Ok(StreamFrame::Heartbeat) => {
                peer.reliable_timers.reset_timeout();
            }
            Ok(StreamFrame::Payload(bytes)) => {
                peer.reliable_timers.reset_timeout();
                peer.reliable_timers.reset_heartbeat();
                let packet = Packet::incoming(&inner.pool, Channel::Reliable, &bytes);
                inner.push_event(DualEvent::Packet(
                    Arc::clone(&peer),
                    packet,
                    Channel::Reliable,
                ));
            }
            Ok(StreamFrame::Control(code)) => {
                handle_stream_control(&inner, &peer, code, &mut read, &mut acc).await;
                return;
            }
            Err(StreamEnd::Cancelled) => return,
            Err(StreamEnd::PeerVanished) => {
                inner.teardown(
                    &peer,
                    Disconnect::new(DisconnectReason::ConnectionClosedForcefully),
                );
                return;
            }
            Err(StreamEnd::Io(err)) => {
                if !peer.cancel_token().is_cancelled() {
                    inner.push_event(DualEvent::NetworkError(
                        Some(Arc::clone(&peer)),
                        NetError::Io(err),
                    ));
                    inner.teardown(&peer, Disconnect::new(DisconnectReason::SocketError));
                }
                return;
            }
            Err(StreamEnd::Violation(reason)) => {
                warn!(peer = %peer.addr(), ?reason, "stream protocol violation");
                inner.teardown(&peer, Disconnect::new(reason));
                return;
            }
        }
    }
}

/// An out-of-band control code always ends the connection; the only
/// question is the reason and whether a goodbye message follows.
async fn handle_stream_control(
    inner: &Arc<Inner>,
    peer: &Arc<Peer>,
    code: i32,
    read: &mut OwnedReadHalf,
    acc: &mut FrameAccumulator,
) {
    let reason = match DisconnectReason::from_code(code) {
        Some(reason) => reason,
        None => {
            warn!(peer = %peer.addr(), code, "unknown control code");
            inner.teardown(peer, Disconnect::new(DisconnectReason::InvalidPacket));
            return;
        }
    };

    if reason == DisconnectReason::ConnectionClosedWithMessage {
        let buffer_size = inner.config.reliable.buffer_size;
        let message = timeout(
            inner.config.handshake_timeout,
            next_stream_frame(&inner.pool, buffer_size, peer, read, acc),
        )
        .await;
        match message {
            Ok(Ok(StreamFrame::Payload(bytes))) => {
                let packet = Packet::incoming(&inner.pool, Channel::Reliable, &bytes);
                inner.teardown(peer, Disconnect::with_message(reason, packet));
            }
            // Anything but a prompt payload frame after the code is a
            // violation.
            _ => {
                inner.teardown(peer, Disconnect::new(DisconnectReason::InvalidPacket));
            }
        }
        return;
    }

    inner.teardown(peer, Disconnect::new(reason));
}

/// Shared datagram receive loop. One per socket: datagrams are routed to
/// peers by sender address; runts and unregistered senders are discarded.
async fn udp_recv_loop(inner: Arc<Inner>, udp: Arc<UdpSocket>, cancel: CancellationToken) {
    let settings = inner.config.unreliable.clone();

    loop {
        let mut buf = inner.pool.rent(settings.buffer_size);
        buf.get_mut().resize(settings.buffer_size, 0);

        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = udp.recv_from(buf.get_mut().as_mut_slice()) => received,
        };
        let (n, from) = match received {
            Ok(received) => received,
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                inner.push_event(DualEvent::NetworkError(None, NetError::Io(err)));
                continue;
            }
        };

        // Too small to carry a length prefix.
        if n < LENGTH_PREFIX {
            continue;
        }
        // Unregistered sender.
        let peer = match inner.table.by_udp_addr(from) {
            Some(peer) => peer,
            None => continue,
        };

        match frame::parse_datagram(&buf.get()[..n], &settings) {
            Ok(DatagramFrame::Heartbeat) => {
                peer.unreliable_timers.reset_timeout();
            }
            Ok(DatagramFrame::Payload(bytes)) => {
                peer.unreliable_timers.reset_timeout();
                peer.unreliable_timers.reset_heartbeat();
                let packet = Packet::incoming(&inner.pool, Channel::Unreliable, &bytes);
                inner.push_event(DualEvent::Packet(peer, packet, Channel::Unreliable));
            }
            Err(reason) => {
                warn!(peer = %peer.addr(), ?reason, "datagram protocol violation");
                inner.teardown(&peer, Disconnect::new(reason));
            }
        }
    }
}
