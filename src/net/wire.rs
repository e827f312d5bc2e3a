//! Peer wire frames.
//!
//! One frame is one JSON object: a line on the TCP transport (NDJSON), a
//! datagram on the discovery socket. Unknown `type` values fail to parse
//! and are skipped by the caller, never fatal to the connection.

use crate::message::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake opener, written by both sides immediately on connect.
    Hello {
        name: String,
        tag: String,
        pubkey: String,
        tcp_port: u16,
    },
    /// A broadcast message (sync and gossip both use this).
    Msg { data: Box<Message> },
    /// Keepalive; any received frame refreshes liveness, this one exists
    /// to generate traffic on otherwise idle connections.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    /// Handshake rejection: the offered name is bound to another pubkey.
    NameTaken { name: String },
    /// LAN multicast announcement (UDP only).
    Discover {
        name: String,
        tag: String,
        pubkey: String,
        tcp_port: u16,
    },
}

impl Frame {
    pub fn command(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Msg { .. } => "msg",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::NameTaken { .. } => "name_taken",
            Frame::Discover { .. } => "discover",
        }
    }

    /// JSON encoding without the line terminator.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    pub fn parse(raw: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(raw.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_match_wire_vocabulary() {
        let hello = Frame::Hello {
            name: "ada".into(),
            tag: "aabb".into(),
            pubkey: "aabbcc".into(),
            tcp_port: 4201,
        };
        let encoded = hello.encode();
        assert!(encoded.contains(r#""type":"hello""#));
        assert!(encoded.contains(r#""tcp_port":4201"#));

        let taken = Frame::NameTaken { name: "ada".into() };
        assert!(taken.encode().contains(r#""type":"name_taken""#));

        let discover = Frame::Discover {
            name: "ada".into(),
            tag: "aabb".into(),
            pubkey: "aabbcc".into(),
            tcp_port: 4201,
        };
        assert!(discover.encode().contains(r#""type":"discover""#));
    }

    #[test]
    fn heartbeat_fields_are_optional() {
        let bare: Frame = Frame::parse(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(bare.command(), "heartbeat");
        let full: Frame = Frame::parse(r#"{"type":"heartbeat","name":"ada","tag":"aabb"}"#).unwrap();
        match full {
            Frame::Heartbeat { name, tag } => {
                assert_eq!(name.as_deref(), Some("ada"));
                assert_eq!(tag.as_deref(), Some("aabb"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        assert!(Frame::parse(r#"{"type":"warez"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::Hello {
            name: "ada".into(),
            tag: "aabb".into(),
            pubkey: "aabbcc".into(),
            tcp_port: 4210,
        };
        let back = Frame::parse(&frame.encode()).unwrap();
        match back {
            Frame::Hello { name, tcp_port, .. } => {
                assert_eq!(name, "ada");
                assert_eq!(tcp_port, 4210);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
