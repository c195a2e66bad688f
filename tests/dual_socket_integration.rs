//! Integration tests for DualSocket: handshake, both channels, disconnects,
//! and liveness monitoring.
//!
//! Run with:
//! ```bash
//! cargo test --test dual_socket_integration -- --nocapture
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use dualnet::{
    Channel, Disconnect, DisconnectReason, DualEvent, DualSocket, NetError, Peer, SocketConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Pumps the socket until the extractor matches an event or the deadline
/// passes. Non-matching events are discarded.
async fn pump_until<T>(
    socket: &DualSocket,
    deadline: Duration,
    mut extract: impl FnMut(DualEvent) -> Option<T>,
) -> Option<T> {
    let start = Instant::now();
    while start.elapsed() < deadline {
        for event in socket.pump() {
            if let Some(value) = extract(event) {
                return Some(value);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Helper: listener on an OS-assigned port, client dialed and accepted,
/// both sides pumped to Connected.
async fn connected_pair() -> (DualSocket, DualSocket, Arc<Peer>, Arc<Peer>) {
    init_tracing();

    let server = DualSocket::new(SocketConfig::listener(0));
    server.listen().await.expect("listener failed to start");
    let port = server.local_addr().unwrap().port();

    let client = DualSocket::new(SocketConfig::client("127.0.0.1".parse().unwrap(), port));
    client.connect().await.expect("client failed to start");

    let request = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::ConnectionRequest(request) => Some(request),
        _ => None,
    })
    .await
    .expect("server should surface a connection request");
    request.accept();

    let server_peer = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Connected(peer) => Some(peer),
        _ => None,
    })
    .await
    .expect("server should reach connected");

    let client_peer = pump_until(&client, Duration::from_secs(5), |event| match event {
        DualEvent::Connected(peer) => Some(peer),
        _ => None,
    })
    .await
    .expect("client should reach connected");

    (server, client, server_peer, client_peer)
}

/// Helper: hand-rolled wire client for tests that need to misbehave.
/// Performs the handshake (read status, answer with the datagram port) and
/// returns both raw sockets.
async fn raw_connected_client(server: &DualSocket) -> (TcpStream, UdpSocket) {
    let port = server.local_addr().unwrap().port();
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let request = pump_until(server, Duration::from_secs(5), |event| match event {
        DualEvent::ConnectionRequest(request) => Some(request),
        _ => None,
    })
    .await
    .expect("server should surface a connection request");
    request.accept();

    let mut status = [0u8; 4];
    tcp.read_exact(&mut status).await.unwrap();
    assert_eq!(i32::from_le_bytes(status), 1, "expected accept status");

    let udp_port = i32::from(udp.local_addr().unwrap().port());
    tcp.write_all(&udp_port.to_le_bytes()).await.unwrap();

    pump_until(server, Duration::from_secs(5), |event| match event {
        DualEvent::Connected(peer) => Some(peer),
        _ => None,
    })
    .await
    .expect("server should reach connected");

    (tcp, udp)
}

#[tokio::test]
async fn test_connect_accept() {
    let (server, client, server_peer, client_peer) = connected_pair().await;

    assert_eq!(server.peer_count(), 1);
    assert_eq!(client.peer_count(), 1);
    assert!(server_peer.is_connected());
    assert!(client_peer.is_connected());
    // The listener learned the client's datagram address during the
    // handshake.
    assert!(server_peer.udp_addr().is_some());
    assert_eq!(client_peer.udp_addr().unwrap().port(), server.local_addr().unwrap().port());
}

#[tokio::test]
async fn test_reliable_round_trip() {
    let (server, client, server_peer, client_peer) = connected_pair().await;

    let mut packet = client.new_packet(Channel::Reliable);
    packet.write_i16(5);
    packet.write_string("abc");
    client
        .send(&client_peer, packet, Channel::Reliable)
        .expect("send failed");

    let mut received = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Packet(_, packet, Channel::Reliable) => Some(packet),
        _ => None,
    })
    .await
    .expect("server should receive the packet");
    assert_eq!(received.read_i16().unwrap(), 5);
    assert_eq!(received.read_string().unwrap(), "abc");
    assert_eq!(received.unread_len(), 0);

    // Echo back the other way.
    let mut reply = server.new_packet(Channel::Reliable);
    reply.write_string("pong");
    server
        .send(&server_peer, reply, Channel::Reliable)
        .expect("echo failed");

    let mut echoed = pump_until(&client, Duration::from_secs(5), |event| match event {
        DualEvent::Packet(_, packet, Channel::Reliable) => Some(packet),
        _ => None,
    })
    .await
    .expect("client should receive the echo");
    assert_eq!(echoed.read_string().unwrap(), "pong");
}

#[tokio::test]
async fn test_unreliable_round_trip() {
    let (server, client, _server_peer, client_peer) = connected_pair().await;

    // Datagrams are best-effort even on loopback, so resend until one
    // lands.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = None;
    while received.is_none() && Instant::now() < deadline {
        let mut packet = client.new_packet(Channel::Unreliable);
        packet.write_u32(0xDEAD_BEEF);
        client
            .send(&client_peer, packet, Channel::Unreliable)
            .expect("send failed");

        received = pump_until(&server, Duration::from_millis(200), |event| match event {
            DualEvent::Packet(_, packet, Channel::Unreliable) => Some(packet),
            _ => None,
        })
        .await;
    }

    let mut packet = received.expect("server should receive a datagram");
    assert_eq!(packet.read_u32().unwrap(), 0xDEAD_BEEF);
}

#[tokio::test]
async fn test_send_validation() {
    let (_server, client, _server_peer, client_peer) = connected_pair().await;

    // Payload over the channel's 128-byte maximum is rejected before the
    // socket sees it.
    let mut oversize = client.new_packet(Channel::Reliable);
    oversize.write_bytes(&[0u8; 200]);
    match client.send(&client_peer, oversize, Channel::Reliable) {
        Err(NetError::OversizePacket { size, limit, .. }) => {
            assert_eq!(size, 200);
            assert_eq!(limit, 128);
        }
        other => panic!("expected oversize rejection, got {other:?}"),
    }

    // A packet built for one channel cannot be sent on the other.
    let mismatched = client.new_packet(Channel::Reliable);
    match client.send(&client_peer, mismatched, Channel::Unreliable) {
        Err(NetError::ChannelMismatch { packet, requested }) => {
            assert_eq!(packet, Channel::Reliable);
            assert_eq!(requested, Channel::Unreliable);
        }
        other => panic!("expected channel mismatch, got {other:?}"),
    }

    // A goodbye message is bound by the same maximum as a regular send.
    let mut oversize_goodbye = client.new_packet(Channel::Reliable);
    oversize_goodbye.write_bytes(&[0u8; 200]);
    match client.disconnect_with(&client_peer, oversize_goodbye) {
        Err(NetError::OversizePacket { size, limit, .. }) => {
            assert_eq!(size, 200);
            assert_eq!(limit, 128);
        }
        other => panic!("expected oversize rejection, got {other:?}"),
    }
    // The rejected disconnect must not have torn the connection down.
    assert!(client_peer.is_connected());
}

#[tokio::test]
async fn test_denied_request_rejects_client() {
    init_tracing();

    let server = DualSocket::new(SocketConfig::listener(0));
    server.listen().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = DualSocket::new(SocketConfig::client("127.0.0.1".parse().unwrap(), port));
    client.connect().await.unwrap();

    let request = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::ConnectionRequest(request) => Some(request),
        _ => None,
    })
    .await
    .expect("server should surface a connection request");
    request.deny();

    let disconnect = pump_until(&client, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("client should be disconnected");
    assert_eq!(disconnect.reason, DisconnectReason::ConnectionRejected);
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn test_graceful_disconnect_with_message() {
    let (server, client, _server_peer, client_peer) = connected_pair().await;

    let mut goodbye = client.new_packet(Channel::Reliable);
    goodbye.write_string("bye");
    client
        .disconnect_with(&client_peer, goodbye)
        .expect("disconnect failed");

    // The remote side sees the reason and the message.
    let disconnect = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("server should see the disconnect");
    assert_eq!(
        disconnect.reason,
        DisconnectReason::ConnectionClosedWithMessage
    );
    let mut message = disconnect.message.expect("disconnect should carry a message");
    assert_eq!(message.read_string().unwrap(), "bye");

    // The local side sees the same reason and message.
    let local: Disconnect = pump_until(&client, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("client should see its own disconnect");
    assert_eq!(local.reason, DisconnectReason::ConnectionClosedWithMessage);
    assert!(local.message.is_some());

    assert_eq!(server.peer_count(), 0);
    assert_eq!(client.peer_count(), 0);
}

#[tokio::test]
async fn test_datagram_length_mismatch_disconnects() {
    init_tracing();

    let server = DualSocket::new(SocketConfig::listener(0));
    server.listen().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let (_tcp, udp) = raw_connected_client(&server).await;

    // Declares 10 payload bytes but carries 4.
    let mut wire = 10i32.to_le_bytes().to_vec();
    wire.extend_from_slice(b"abcd");
    udp.send_to(&wire, ("127.0.0.1", port)).await.unwrap();

    let disconnect = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("server should disconnect the violating peer");
    assert_eq!(disconnect.reason, DisconnectReason::InvalidPacket);
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn test_datagram_control_code_rejected() {
    init_tracing();

    let server = DualSocket::new(SocketConfig::listener(0));
    server.listen().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let (_tcp, udp) = raw_connected_client(&server).await;

    // A forged graceful-disconnect code over the datagram channel must be
    // treated as a violation, not honored as a goodbye.
    udp.send_to(&(-1i32).to_le_bytes(), ("127.0.0.1", port))
        .await
        .unwrap();

    let disconnect = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("server should disconnect the violating peer");
    assert_eq!(disconnect.reason, DisconnectReason::InvalidPacket);
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn test_heartbeats_reach_the_wire() {
    init_tracing();

    let mut config = SocketConfig::listener(0);
    config.tick_interval = Duration::from_millis(50);
    config.reliable.heartbeat_interval = Duration::from_millis(200);
    let server = DualSocket::new(config);
    server.listen().await.unwrap();

    let (mut tcp, _udp) = raw_connected_client(&server).await;

    // An idle stream channel must carry a zero-length frame within a few
    // heartbeat intervals.
    let mut prefix = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), tcp.read_exact(&mut prefix))
        .await
        .expect("expected a heartbeat before the deadline")
        .unwrap();
    assert_eq!(i32::from_le_bytes(prefix), 0);

    // Idle past the heartbeat interval but well inside the timeout: the
    // connection stays up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.pump().iter().all(|event| !matches!(event, DualEvent::Disconnected(..))));
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    init_tracing();

    let mut config = SocketConfig::listener(0);
    config.tick_interval = Duration::from_millis(50);
    config.reliable.timeout = Duration::from_millis(300);
    let server = DualSocket::new(config);
    server.listen().await.unwrap();

    // Handshakes, then never sends another byte.
    let (_tcp, _udp) = raw_connected_client(&server).await;

    let disconnect = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("server should drop the silent peer");
    assert_eq!(disconnect.reason, DisconnectReason::ConnectionLost);
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn test_vanished_peer_detected() {
    let (server, client, _server_peer, _client_peer) = connected_pair().await;

    // Drop the client's sockets without a goodbye.
    client.close(false).await;

    let disconnect = pump_until(&server, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("server should notice the vanished peer");
    assert_eq!(disconnect.reason, DisconnectReason::ConnectionClosedForcefully);
}

#[tokio::test]
async fn test_close_notifies_peers() {
    let (server, client, _server_peer, _client_peer) = connected_pair().await;

    server.close(true).await;
    assert!(server.mode().is_none());
    assert_eq!(server.peer_count(), 0);

    let disconnect = pump_until(&client, Duration::from_secs(5), |event| match event {
        DualEvent::Disconnected(_, disconnect) => Some(disconnect),
        _ => None,
    })
    .await
    .expect("client should be notified of the shutdown");
    assert_eq!(disconnect.reason, DisconnectReason::ConnectionClosed);

    // A closed socket may be started again.
    server.listen().await.expect("restart after close failed");
    assert!(server.local_addr().is_some());
    server.close(false).await;
}

#[tokio::test]
async fn test_double_start_rejected() {
    init_tracing();

    let server = DualSocket::new(SocketConfig::listener(0));
    server.listen().await.unwrap();

    match server.listen().await {
        Err(NetError::AlreadyRunning) => {}
        other => panic!("expected already-running error, got {other:?}"),
    }
}
