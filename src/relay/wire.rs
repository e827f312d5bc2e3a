//! Relay wire frames: JSON text over WebSocket.
//!
//! The same vocabulary serves both directions. Peer-originated frames
//! (`hello`, `msg`, `key_request`, `key_share`, `heartbeat`) are parsed by
//! the relay only far enough to route them; envelopes are never inspected.

use serde::{Deserialize, Serialize};

/// Session entry as listed in `relay_peers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session: String,
    pub curve_pk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Anonymous session opener: fresh UUID and X25519 public key, nothing
    /// that identifies the person behind it.
    Hello { session: String, curve_pk: String },
    /// Encrypted message envelope (base64 secret box).
    Msg { envelope: String },
    /// Ask current room-key holders to seal the key to us.
    KeyRequest { session: String, curve_pk: String },
    /// Sealed room key for one recipient session.
    KeyShare { to: String, sealed: String },
    /// Keepalive, dropped by the relay.
    Heartbeat,
    /// Relay → client: snapshot of the other sessions present.
    RelayPeers { peers: Vec<SessionInfo>, count: usize },
    /// Relay → client: a session joined (delayed broadcast).
    RelayJoin {
        session: String,
        curve_pk: String,
        ts: f64,
    },
    /// Relay → client: a session left.
    RelayLeave { session: String },
    /// Relay → client: operator wallet address, informational.
    RelayWallet { address: String },
}

impl RelayFrame {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    pub fn parse(raw: &str) -> Result<RelayFrame, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Metadata-only events published on the scanner feed. Counters and
/// timestamps, never content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    Snapshot {
        peers_online: usize,
        total_messages: u64,
        total_connections: u64,
        uptime: f64,
        relay_wallet: Option<String>,
    },
    PeerJoin { peers_online: usize, ts: f64 },
    PeerLeave { peers_online: usize, ts: f64 },
    Activity { ts: f64 },
}

impl ScanEvent {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_vocabulary_on_the_wire() {
        let hello = RelayFrame::Hello {
            session: "s1".into(),
            curve_pk: "aabb".into(),
        };
        assert!(hello.encode().contains(r#""type":"hello""#));

        let req = RelayFrame::KeyRequest {
            session: "s1".into(),
            curve_pk: "aabb".into(),
        };
        assert!(req.encode().contains(r#""type":"key_request""#));

        assert_eq!(RelayFrame::Heartbeat.encode(), r#"{"type":"heartbeat"}"#);
    }

    #[test]
    fn key_share_routing_fields() {
        let share = RelayFrame::parse(r#"{"type":"key_share","to":"s2","sealed":"QUJD"}"#).unwrap();
        match share {
            RelayFrame::KeyShare { to, sealed } => {
                assert_eq!(to, "s2");
                assert_eq!(sealed, "QUJD");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_frames_fail_to_parse() {
        assert!(RelayFrame::parse(r#"{"type":"exfiltrate"}"#).is_err());
        assert!(RelayFrame::parse("[]").is_err());
    }
}
