//! Per-peer state.
//!
//! A peer owns nothing but its identity, its address and the sender side
//! of its writer channel; the writer task owns the socket half. Outbound
//! frames from any task funnel through the channel, so writes to one peer
//! never interleave.

use crate::config::PEER_TIMEOUT_SECS;
use crate::types::now;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Connected, handshaken peer.
pub struct Peer {
    pub name: String,
    pub tag: String,
    pub pubkey: String,
    pub addr: SocketAddr,
    /// Unix seconds of the last frame received from this peer.
    pub last_seen: u64,
    /// Pre-encoded NDJSON lines (no terminator); the writer task appends
    /// the newline and performs the socket write.
    tx: mpsc::UnboundedSender<String>,
}

impl Peer {
    pub fn new(
        name: String,
        tag: String,
        pubkey: String,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            name,
            tag,
            pubkey,
            addr,
            last_seen: now(),
            tx,
        }
    }

    /// `name#tag`, the peer-table key.
    pub fn peer_id(&self) -> String {
        format!("{}#{}", self.name, self.tag)
    }

    /// Refresh liveness. Any received frame counts.
    pub fn touch(&mut self) {
        self.last_seen = now();
    }

    pub fn is_alive(&self) -> bool {
        now().saturating_sub(self.last_seen) < PEER_TIMEOUT_SECS
    }

    /// Queue a frame for this peer. False when the writer task is gone.
    pub fn send(&self, line: &str) -> bool {
        self.tx.send(line.to_string()).is_ok()
    }
}

/// Snapshot of a peer for external queries.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub pubkey: String,
    pub addr: SocketAddr,
    pub last_seen: u64,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            peer_id: peer.peer_id(),
            pubkey: peer.pubkey.clone(),
            addr: peer.addr,
            last_seen: peer.last_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Peer, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            "ada".into(),
            "aabb".into(),
            "aabbcc".into(),
            "127.0.0.1:4201".parse().unwrap(),
            tx,
        );
        (peer, rx)
    }

    #[test]
    fn peer_id_format() {
        let (peer, _rx) = sample();
        assert_eq!(peer.peer_id(), "ada#aabb");
        assert!(peer.is_alive());
    }

    #[test]
    fn send_queues_until_writer_drops() {
        let (peer, mut rx) = sample();
        assert!(peer.send("{\"type\":\"heartbeat\"}"));
        assert_eq!(rx.try_recv().unwrap(), "{\"type\":\"heartbeat\"}");
        drop(rx);
        assert!(!peer.send("{}"));
    }

    #[test]
    fn staleness_threshold() {
        let (mut peer, _rx) = sample();
        peer.last_seen = now() - PEER_TIMEOUT_SECS - 1;
        assert!(!peer.is_alive());
        peer.touch();
        assert!(peer.is_alive());
    }
}
