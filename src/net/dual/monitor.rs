//! Heartbeat & timeout monitor.
//!
//! One ticker per socket. Each tick walks the connected peers, disconnects
//! the ones whose silence exceeded a channel timeout, sends heartbeats on
//! channels idle past their interval, and advances all four elapsed-time
//! accumulators. The two channels run independent schedules.

use std::sync::Arc;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::Channel;

use super::error::{Disconnect, DisconnectReason};
use super::peer::Outbound;
use super::socket::Inner;

pub(crate) async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    let tick = inner.config.tick_interval;
    let tick_ms = tick.as_millis() as u64;
    let mut ticker = interval(tick);
    // The first tick fires immediately; skip it so accumulators start at
    // zero elapsed.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        for peer in inner.table.peers() {
            if !peer.is_connected() {
                continue;
            }

            if peer.reliable_timers.timed_out(inner.config.reliable.timeout)
                || peer.unreliable_timers.timed_out(inner.config.unreliable.timeout)
            {
                debug!(peer = %peer.addr(), "liveness timeout");
                inner.teardown(&peer, Disconnect::new(DisconnectReason::ConnectionLost));
                continue;
            }

            if peer
                .reliable_timers
                .heartbeat_due(inner.config.reliable.heartbeat_interval)
            {
                let _ = peer.queue(Outbound::Heartbeat(Channel::Reliable));
                peer.reliable_timers.reset_heartbeat();
            }

            if peer
                .unreliable_timers
                .heartbeat_due(inner.config.unreliable.heartbeat_interval)
            {
                let _ = peer.queue(Outbound::Heartbeat(Channel::Unreliable));
                peer.unreliable_timers.reset_heartbeat();
            }

            peer.reliable_timers.advance(tick_ms);
            peer.unreliable_timers.advance(tick_ms);
        }
    }
}
