//! Address-keyed registries of connected peers, one per channel.
//!
//! The reliable map is canonical: a peer is inserted there first and its
//! unreliable entry is added only once the datagram address is discovered
//! through the handshake. Removal clears the reliable entry first, so an
//! unreliable entry always implies a (possibly already-removed) reliable
//! entry for the same peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use super::peer::Peer;

#[derive(Default)]
pub(crate) struct PeerTable {
    reliable: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    unreliable: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
}

impl PeerTable {
    /// Registers a peer under its stream address.
    pub(crate) fn insert_reliable(&self, peer: Arc<Peer>) {
        self.reliable.lock().unwrap().insert(peer.addr(), peer);
    }

    /// Registers a peer under its discovered datagram address. The peer
    /// must already hold one.
    pub(crate) fn insert_unreliable(&self, peer: Arc<Peer>) {
        let addr = peer
            .udp_addr()
            .expect("datagram address registered before it was exchanged");
        self.unreliable.lock().unwrap().insert(addr, peer);
    }

    /// Routes a received datagram to its sender's peer, if registered.
    pub(crate) fn by_udp_addr(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.unreliable.lock().unwrap().get(&addr).cloned()
    }

    pub(crate) fn contains(&self, peer: &Peer) -> bool {
        self.reliable.lock().unwrap().contains_key(&peer.addr())
    }

    /// Removes a peer from both maps, reliable first.
    pub(crate) fn remove(&self, peer: &Peer) {
        self.reliable.lock().unwrap().remove(&peer.addr());
        if let Some(udp_addr) = peer.udp_addr() {
            self.unreliable.lock().unwrap().remove(&udp_addr);
        }
    }

    /// Snapshot of every registered peer.
    pub(crate) fn peers(&self) -> Vec<Arc<Peer>> {
        self.reliable.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.reliable.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.reliable.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::dual::config::SocketConfig;
    use crate::net::dual::peer::PeerState;
    use crate::net::dual::socket::Inner;
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    async fn test_peer(inner: &Arc<Inner>) -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let _client = dial.await.unwrap();

        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Peer::launch(inner, accepted, udp, PeerState::AcceptPending).unwrap()
    }

    #[tokio::test]
    async fn test_unreliable_entry_implies_reliable_entry() {
        let inner = Inner::new(SocketConfig::listener(0));
        let table = PeerTable::default();
        let peer = test_peer(&inner).await;

        table.insert_reliable(Arc::clone(&peer));
        peer.set_udp_addr("127.0.0.1:9999".parse().unwrap());
        table.insert_unreliable(Arc::clone(&peer));

        let routed = table.by_udp_addr("127.0.0.1:9999".parse().unwrap()).unwrap();
        assert_eq!(routed.addr(), peer.addr());
        assert!(table.contains(&peer));

        table.remove(&peer);
        assert!(!table.contains(&peer));
        assert!(table.by_udp_addr("127.0.0.1:9999".parse().unwrap()).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_datagram_sender_not_routed() {
        let inner = Inner::new(SocketConfig::listener(0));
        let table = PeerTable::default();
        let peer = test_peer(&inner).await;
        table.insert_reliable(peer);

        assert!(table.by_udp_addr("127.0.0.1:1234".parse().unwrap()).is_none());
    }
}
