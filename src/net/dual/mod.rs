//! Dual-channel transport implementation.

mod config;
mod error;
mod event;
mod frame;
mod handshake;
mod monitor;
mod packet;
mod peer;
mod pool;
mod socket;
mod table;

pub use config::{ChannelSettings, SocketConfig};
pub use error::{Disconnect, DisconnectReason, NetError};
pub use event::{ConnectRequest, DualEvent};
pub use packet::{Packet, PacketData};
pub use peer::{Peer, PeerState};
pub use pool::{BufferPool, PooledBuf};
pub use socket::DualSocket;
