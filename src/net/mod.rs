//! Networking layers.

pub mod dual;

pub use dual::{
    ChannelSettings, ConnectRequest, Disconnect, DisconnectReason, DualEvent, DualSocket,
    NetError, Packet, PacketData, Peer, PeerState, SocketConfig,
};
