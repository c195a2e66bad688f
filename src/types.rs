//! Small shared types used across the transport.

/// Which of the two transport channels a packet travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, connection-oriented byte stream (TCP).
    Reliable,
    /// Connectionless, best-effort datagrams (UDP).
    Unreliable,
}

/// Role the socket was started in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketMode {
    /// Outgoing connection to a single listener.
    Client,
    /// Accepts incoming connections from many clients.
    Listener,
}
