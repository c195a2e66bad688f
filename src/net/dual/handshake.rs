//! Connect/accept handshake drivers.
//!
//! Sequence over the stream channel, before framed traffic begins:
//!
//! 1. Client dials the stream socket and binds a datagram socket to an
//!    ephemeral local port.
//! 2. Listener surfaces a [`ConnectRequest`](super::event::ConnectRequest)
//!    to the host application and waits for its decision.
//! 3. On accept the listener replies status `1`, the client answers with
//!    its datagram port as a raw i32, and the listener validates it is in
//!    1..=65535. On deny the listener replies status `0` and hangs up.
//! 4. Both sides reach `Connected` only once the datagram address is
//!    known on both ends.
//!
//! Every step is bounded by the configured handshake timeout; exceeding it
//! tears the pending peer down with a connection-lost reason.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::{Disconnect, DisconnectReason, NetError};
use super::event::DualEvent;
use super::peer::{Outbound, Peer, PeerState};
use super::socket::{self, Inner};

pub(crate) const STATUS_ACCEPT: i32 = 1;
pub(crate) const STATUS_DENY: i32 = 0;

enum HandshakeFailure {
    TimedOut,
    PeerVanished,
    Io(io::Error),
}

/// Reads one raw little-endian i32 off the stream within the handshake
/// bound.
async fn read_handshake_i32(
    read: &mut OwnedReadHalf,
    bound: std::time::Duration,
) -> Result<i32, HandshakeFailure> {
    let mut bytes = [0u8; 4];
    match timeout(bound, read.read_exact(&mut bytes)).await {
        Ok(Ok(_)) => Ok(i32::from_le_bytes(bytes)),
        Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(HandshakeFailure::PeerVanished)
        }
        Ok(Err(err)) => Err(HandshakeFailure::Io(err)),
        Err(_) => Err(HandshakeFailure::TimedOut),
    }
}

/// Listener side, after the host application accepted the request: send
/// the accept status, wait for the client's datagram port, validate and
/// register it.
pub(crate) async fn finish_accept(inner: Arc<Inner>, peer: Arc<Peer>) {
    if peer.queue(Outbound::Handshake(STATUS_ACCEPT)).is_err() {
        return;
    }
    peer.set_state(PeerState::AwaitingPeerInfo);

    let mut read = match peer.take_read_half() {
        Some(read) => read,
        None => return,
    };

    match read_handshake_i32(&mut read, inner.config.handshake_timeout).await {
        Ok(port @ 1..=65535) => {
            peer.set_udp_addr(SocketAddr::new(peer.addr().ip(), port as u16));
            debug!(peer = %peer.addr(), port, "datagram port registered");
            complete_connection(&inner, peer, read);
        }
        Ok(port) => {
            warn!(peer = %peer.addr(), port, "datagram port out of range");
            inner.teardown(&peer, Disconnect::new(DisconnectReason::InvalidPacket));
        }
        Err(failure) => fail_handshake(&inner, &peer, failure),
    }
}

/// Client side: wait for the listener's status reply, then answer with the
/// local datagram port.
pub(crate) async fn run_client(
    inner: Arc<Inner>,
    peer: Arc<Peer>,
    mut read: OwnedReadHalf,
    local_udp_port: u16,
) {
    peer.set_state(PeerState::AwaitingStatus);

    match read_handshake_i32(&mut read, inner.config.handshake_timeout).await {
        Ok(STATUS_ACCEPT) => {
            if peer
                .queue(Outbound::Handshake(i32::from(local_udp_port)))
                .is_err()
            {
                return;
            }
            debug!(peer = %peer.addr(), port = local_udp_port, "datagram port sent");
            complete_connection(&inner, peer, read);
        }
        Ok(STATUS_DENY) => {
            debug!(peer = %peer.addr(), "connection rejected by listener");
            inner.teardown(&peer, Disconnect::new(DisconnectReason::ConnectionRejected));
        }
        Ok(status) => {
            warn!(peer = %peer.addr(), status, "unexpected handshake status");
            inner.teardown(&peer, Disconnect::new(DisconnectReason::InvalidPacket));
        }
        Err(failure) => fail_handshake(&inner, &peer, failure),
    }
}

/// Both channels are known on both ends: register the peer, surface the
/// connected event, and hand the read half to the stream receive loop.
fn complete_connection(inner: &Arc<Inner>, peer: Arc<Peer>, read: OwnedReadHalf) {
    inner.table.insert_reliable(Arc::clone(&peer));
    inner.table.insert_unreliable(Arc::clone(&peer));
    peer.set_state(PeerState::Connected);
    inner.push_event(DualEvent::Connected(Arc::clone(&peer)));
    inner.spawn(socket::stream_recv_loop(
        Arc::clone(inner),
        peer,
        read,
    ));
}

fn fail_handshake(inner: &Arc<Inner>, peer: &Arc<Peer>, failure: HandshakeFailure) {
    match failure {
        HandshakeFailure::TimedOut => {
            warn!(peer = %peer.addr(), "handshake step timed out");
            inner.teardown(peer, Disconnect::new(DisconnectReason::ConnectionLost));
        }
        HandshakeFailure::PeerVanished => {
            inner.teardown(
                peer,
                Disconnect::new(DisconnectReason::ConnectionClosedForcefully),
            );
        }
        HandshakeFailure::Io(err) => {
            if !peer.cancel_token().is_cancelled() {
                inner.push_event(DualEvent::NetworkError(
                    Some(Arc::clone(peer)),
                    NetError::Io(err),
                ));
                inner.teardown(peer, Disconnect::new(DisconnectReason::SocketError));
            }
        }
    }
}
