//! Configuration for the dual-channel socket.

use std::net::IpAddr;
use std::time::Duration;

/// Per-channel tuning. The two channels are configured independently:
/// datagram loss is expected and tolerated, stream silence is not, so
/// their heartbeat and timeout schedules differ.
#[derive(Clone, Debug)]
pub struct ChannelSettings {
    /// Largest payload accepted for a single packet. Oversize sends are
    /// rejected before touching the socket; oversize declared lengths on
    /// receive disconnect the peer.
    pub max_packet_size: usize,
    /// Receive buffer size for this channel.
    pub buffer_size: usize,
    /// Idle time on this channel before a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Silence on this channel before the peer is considered lost.
    pub timeout: Duration,
}

impl ChannelSettings {
    pub fn reliable_defaults() -> Self {
        Self {
            max_packet_size: 128,
            buffer_size: 1024,
            heartbeat_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn unreliable_defaults() -> Self {
        Self {
            max_packet_size: 128,
            buffer_size: 4096,
            heartbeat_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Socket-wide configuration.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Remote address to dial (client). Ignored by a listener, which
    /// binds every interface.
    pub address: Option<IpAddr>,
    /// Port to dial or listen on. A listener may pass 0 for an
    /// OS-assigned port; the datagram socket is then bound to whatever
    /// port the stream listener received.
    pub port: u16,
    /// Pending-connection backlog for the stream listener.
    pub backlog: u32,
    /// Reliable (stream) channel settings.
    pub reliable: ChannelSettings,
    /// Unreliable (datagram) channel settings.
    pub unreliable: ChannelSettings,
    /// Bound on each handshake step (status wait, port exchange).
    pub handshake_timeout: Duration,
    /// Tick of the heartbeat & timeout monitor.
    pub tick_interval: Duration,
}

impl SocketConfig {
    /// Client configuration dialing `address:port`.
    pub fn client(address: IpAddr, port: u16) -> Self {
        Self {
            address: Some(address),
            port,
            ..Self::defaults()
        }
    }

    /// Listener configuration on `port`.
    pub fn listener(port: u16) -> Self {
        Self {
            address: None,
            port,
            ..Self::defaults()
        }
    }

    fn defaults() -> Self {
        Self {
            address: None,
            port: 0,
            backlog: 100,
            reliable: ChannelSettings::reliable_defaults(),
            unreliable: ChannelSettings::unreliable_defaults(),
            handshake_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_defaults_differ() {
        let reliable = ChannelSettings::reliable_defaults();
        let unreliable = ChannelSettings::unreliable_defaults();

        // Datagram loss is tolerated for longer than stream silence.
        assert!(unreliable.timeout > reliable.timeout);
        assert!(unreliable.heartbeat_interval < reliable.heartbeat_interval);
        assert!(unreliable.buffer_size > reliable.buffer_size);
    }

    #[test]
    fn test_client_config_carries_target() {
        let config = SocketConfig::client("127.0.0.1".parse().unwrap(), 7777);
        assert_eq!(config.port, 7777);
        assert!(config.address.is_some());
        assert_eq!(config.backlog, 100);
    }
}
