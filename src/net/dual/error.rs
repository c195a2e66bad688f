//! Error types and disconnect reasons.

use std::io;

use thiserror::Error;

use crate::types::Channel;

use super::packet::Packet;

/// Errors surfaced by the public API or through the network-error event.
#[derive(Error, Debug)]
pub enum NetError {
    /// OS-level socket failure.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// A send whose payload exceeds the channel's configured maximum.
    /// Rejected before the packet touches the socket.
    #[error("packet of {size} bytes exceeds the {limit}-byte maximum for the {channel:?} channel")]
    OversizePacket {
        channel: Channel,
        size: usize,
        limit: usize,
    },

    /// The packet was built for a different channel than the send asked for.
    #[error("packet was created for the {packet:?} channel, not {requested:?}")]
    ChannelMismatch {
        packet: Channel,
        requested: Channel,
    },

    /// Operation against a peer that is not (or no longer) connected.
    #[error("peer is not connected")]
    NotConnected,

    /// `connect`/`listen` called while the socket is already running.
    #[error("socket is already running, call close() first")]
    AlreadyRunning,

    /// A read past the written extent of a packet.
    #[error("packet underflow: needed {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },

    /// A string field that is not valid UTF-8 or has a negative length.
    #[error("malformed string field")]
    MalformedString,
}

/// Why a connection ended.
///
/// The discriminants are the negative control codes multiplexed into the
/// length-prefix slot on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum DisconnectReason {
    /// Graceful disconnect requested by the local or remote application.
    ConnectionClosed = -1,
    /// Graceful disconnect carrying an application message packet.
    ConnectionClosedWithMessage = -2,
    /// The peer released its socket without notice.
    ConnectionClosedForcefully = -3,
    /// The listener denied the connection request.
    ConnectionRejected = -4,
    /// Handshake or liveness timeout.
    ConnectionLost = -5,
    /// An OS-level socket fault tore the connection down.
    SocketError = -6,
    /// A protocol violation: bad handshake value, length mismatch, or an
    /// unknown control code.
    InvalidPacket = -7,
    /// A declared frame length above the channel's max packet size.
    PacketOverMaxSize = -8,
    /// A declared frame length above the channel's receive buffer size.
    PacketOverBufferSize = -9,
}

impl DisconnectReason {
    /// The wire control code for this reason.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a wire control code. Unknown codes are `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::ConnectionClosed),
            -2 => Some(Self::ConnectionClosedWithMessage),
            -3 => Some(Self::ConnectionClosedForcefully),
            -4 => Some(Self::ConnectionRejected),
            -5 => Some(Self::ConnectionLost),
            -6 => Some(Self::SocketError),
            -7 => Some(Self::InvalidPacket),
            -8 => Some(Self::PacketOverMaxSize),
            -9 => Some(Self::PacketOverBufferSize),
            _ => None,
        }
    }
}

/// The cause handed to the disconnected event, with the optional message
/// packet a graceful disconnect may carry.
#[derive(Debug)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    pub message: Option<Packet>,
}

impl Disconnect {
    pub(crate) fn new(reason: DisconnectReason) -> Self {
        Self {
            reason,
            message: None,
        }
    }

    pub(crate) fn with_message(reason: DisconnectReason, message: Packet) -> Self {
        Self {
            reason,
            message: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in -9..=-1 {
            let reason = DisconnectReason::from_code(code).unwrap();
            assert_eq!(reason.code(), code);
        }
    }

    #[test]
    fn test_unknown_codes_rejected() {
        assert!(DisconnectReason::from_code(0).is_none());
        assert!(DisconnectReason::from_code(-10).is_none());
        assert!(DisconnectReason::from_code(1).is_none());
    }
}
