//! # DualNet - Dual-Channel Game Transport
//!
//! DualNet pairs an ordered, reliable byte stream (TCP) with best-effort
//! datagrams (UDP) under one connection, for games that need both
//! guaranteed delivery (state, chat, lifecycle) and cheap high-frequency
//! updates (movement, voice) to the same peer.
//!
//! ## Quick Start
//!
//! ### Listener
//!
//! ```rust,no_run
//! use dualnet::{DualEvent, DualSocket, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dualnet::NetError> {
//!     let socket = DualSocket::new(SocketConfig::listener(7777));
//!     socket.listen().await?;
//!
//!     loop {
//!         for event in socket.pump() {
//!             match event {
//!                 DualEvent::ConnectionRequest(request) => {
//!                     println!("incoming from {}", request.addr());
//!                     request.accept();
//!                 }
//!                 DualEvent::Connected(peer) => {
//!                     println!("{} connected", peer.addr());
//!                 }
//!                 DualEvent::Packet(peer, mut packet, channel) => {
//!                     // Echo back on the same channel.
//!                     let mut reply = socket.new_packet(channel);
//!                     reply.write_bytes(&packet.read_remaining());
//!                     socket.send(&peer, reply, channel)?;
//!                 }
//!                 DualEvent::Disconnected(peer, disconnect) => {
//!                     println!("{} left: {:?}", peer.addr(), disconnect.reason);
//!                 }
//!                 DualEvent::NetworkError(_, err) => eprintln!("{err}"),
//!             }
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//!     }
//! }
//! ```
//!
//! ### Client
//!
//! ```rust,no_run
//! use dualnet::{Channel, DualEvent, DualSocket, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dualnet::NetError> {
//!     let socket = DualSocket::new(SocketConfig::client("127.0.0.1".parse().unwrap(), 7777));
//!     socket.connect().await?;
//!
//!     loop {
//!         for event in socket.pump() {
//!             if let DualEvent::Connected(peer) = event {
//!                 let mut packet = socket.new_packet(Channel::Reliable);
//!                 packet.write_string("hello");
//!                 socket.send(&peer, packet, Channel::Reliable)?;
//!             }
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        DualSocket                          │
//! │                                                            │
//! │  connect()/listen()   send()   disconnect()   pump()       │
//! └──────┬──────────────────┬──────────┬─────────────▲─────────┘
//!        │                  │          │             │
//!        │           ┌──────▼──────────▼──────┐  ┌───┴────────┐
//!        │           │  per-peer writer task  │  │ event drain│
//!        │           │  (both channels, FIFO) │  │   queue    │
//!        │           └──────┬──────────┬──────┘  └───▲────────┘
//!        │                  │          │             │
//! ┌──────▼──────┐    ┌──────▼───┐  ┌───▼──────┐  ┌───┴────────┐
//! │ accept loop │    │   TCP    │  │   UDP    │  │  monitor   │
//! │ (listener)  │    │  stream  │  │ datagram │  │ (heartbeat │
//! │             │    │ recv loop│  │ recv loop│  │ & timeout) │
//! └─────────────┘    └──────────┘  └──────────┘  └────────────┘
//! ```
//!
//! Every frame on either channel starts with a signed 32-bit length
//! prefix: positive for payload, zero for a heartbeat, negative for an
//! out-of-band control code. Connections open with an accept/deny
//! handshake over the stream channel during which the client's datagram
//! port is exchanged; both sides then monitor liveness per channel with
//! heartbeats and silence timeouts.
//!
//! All socket work runs on background tasks. Nothing calls user code
//! directly: every event is queued and delivered only when the host
//! drains [`DualSocket::pump`], so callbacks never race each other.

pub mod net;
mod types;

pub use net::{
    ChannelSettings, ConnectRequest, Disconnect, DisconnectReason, DualEvent, DualSocket,
    NetError, Packet, PacketData, Peer, PeerState, SocketConfig,
};
pub use types::{Channel, SocketMode};
