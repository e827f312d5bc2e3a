//! The message object: canonical serialization, hashcash proof of work,
//! signature binding and TTL arithmetic.
//!
//! Two canonical byte forms exist. The PoW preimage covers the immutable
//! content fields; the signature preimage additionally covers `nonce` and
//! `pow_hash`. Both are compact JSON with lexicographic key order so that
//! independent implementations hash and sign identical bytes. File
//! attachment fields are excluded from both.

use crate::config::{MAX_MESSAGE_LENGTH, MESSAGE_TTL_SECS};
use crate::crypto::{pubkey_tag, verify_hex, Identity};
use crate::types::now_f64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// `prev_hash` of a sender that has not yet admitted any message.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Code,
    File,
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("content too long ({0} chars)")]
    TooLong(usize),
}

/// Why an inbound message was refused. Rejections are silent on the wire;
/// this only feeds logs and tests.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("content oversized")]
    Oversized,
    #[error("expired")]
    Expired,
    #[error("author tag does not match pubkey")]
    TagMismatch,
    #[error("proof of work invalid")]
    BadPow,
    #[error("signature invalid")]
    BadSignature,
}

/// Immutable signed broadcast message. Created once by its author, then
/// only copied; there is no mutation after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// PoW hash of the last message the sender admitted (advisory only).
    pub prev_hash: String,
    pub author_name: String,
    pub author_tag: String,
    pub author_pubkey: String,
    pub content: String,
    pub content_type: ContentType,
    /// Wall-clock seconds, fractional.
    pub timestamp: f64,
    pub ttl: u64,
    /// 8-byte PoW witness, hex.
    pub nonce: String,
    /// SHA-256(pow_preimage ∥ nonce), hex.
    pub pow_hash: String,
    /// Ed25519 over the signature preimage, hex.
    pub signature: String,
    #[serde(default = "default_board")]
    pub board: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub thread_title: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_data: String,
    #[serde(default, skip_serializing_if = "file_size_absent")]
    pub file_size: u64,
}

fn default_board() -> String {
    "general".to_string()
}

fn file_size_absent(size: &u64) -> bool {
    *size == 0
}

/// Draft of a locally authored message, before mining and signing.
#[derive(Debug, Clone, Default)]
pub struct Outgoing {
    pub content: String,
    pub content_type: ContentType,
    pub board: String,
    pub thread_id: String,
    pub thread_title: String,
    pub reply_to: String,
    pub file_name: String,
    pub file_data: String,
    pub file_size: u64,
}

impl Outgoing {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            board: default_board(),
            ..Default::default()
        }
    }

    pub fn on_board(mut self, board: impl Into<String>) -> Self {
        self.board = board.into();
        self
    }
}

impl Message {
    /// Mine and sign a new message. Blocking (the PoW loop runs here);
    /// callers dispatch to a worker thread, never the I/O executor.
    pub fn create(
        identity: &Identity,
        prev_hash: &str,
        outgoing: Outgoing,
        difficulty: u32,
    ) -> Result<Message, MessageError> {
        let chars = outgoing.content.chars().count();
        if outgoing.content_type != ContentType::File && chars > MAX_MESSAGE_LENGTH {
            return Err(MessageError::TooLong(chars));
        }

        let board = if outgoing.board.is_empty() {
            default_board()
        } else {
            outgoing.board
        };

        let mut msg = Message {
            id: Uuid::new_v4().to_string(),
            prev_hash: prev_hash.to_string(),
            author_name: identity.name.clone(),
            author_tag: identity.tag(),
            author_pubkey: identity.pubkey_hex(),
            content: outgoing.content,
            content_type: outgoing.content_type,
            timestamp: now_f64(),
            ttl: MESSAGE_TTL_SECS,
            nonce: String::new(),
            pow_hash: String::new(),
            signature: String::new(),
            board,
            thread_id: outgoing.thread_id,
            thread_title: outgoing.thread_title,
            reply_to: outgoing.reply_to,
            file_name: outgoing.file_name,
            file_data: outgoing.file_data,
            file_size: outgoing.file_size,
        };

        let (nonce, pow_hash) = mine_pow(&msg.pow_preimage(), difficulty);
        msg.nonce = nonce;
        msg.pow_hash = pow_hash;
        msg.signature = identity.sign_hex(&msg.sig_preimage());
        Ok(msg)
    }

    /// Canonical bytes fed to the PoW miner (excludes nonce, pow_hash,
    /// signature and file fields).
    ///
    /// `serde_json::Map` is BTreeMap-backed, so keys serialize in
    /// lexicographic order; `to_vec` emits no insignificant whitespace.
    pub fn pow_preimage(&self) -> Vec<u8> {
        let value = json!({
            "id": self.id,
            "prev_hash": self.prev_hash,
            "author_name": self.author_name,
            "author_tag": self.author_tag,
            "author_pubkey": self.author_pubkey,
            "content": self.content,
            "content_type": self.content_type,
            "timestamp": self.timestamp,
            "ttl": self.ttl,
            "board": self.board,
            "thread_id": self.thread_id,
            "thread_title": self.thread_title,
            "reply_to": self.reply_to,
        });
        serde_json::to_vec(&value).unwrap()
    }

    /// Canonical bytes that get signed: the PoW preimage fields plus
    /// `nonce` and `pow_hash`.
    pub fn sig_preimage(&self) -> Vec<u8> {
        let value = json!({
            "id": self.id,
            "prev_hash": self.prev_hash,
            "author_name": self.author_name,
            "author_tag": self.author_tag,
            "author_pubkey": self.author_pubkey,
            "content": self.content,
            "content_type": self.content_type,
            "timestamp": self.timestamp,
            "ttl": self.ttl,
            "nonce": self.nonce,
            "pow_hash": self.pow_hash,
            "board": self.board,
            "thread_id": self.thread_id,
            "thread_title": self.thread_title,
            "reply_to": self.reply_to,
        });
        serde_json::to_vec(&value).unwrap()
    }

    /// Full admission check for inbound messages: size, TTL, tag binding,
    /// proof of work, signature. One hash plus one signature verification;
    /// callers run it off the I/O executor.
    pub fn validate(&self, difficulty: u32) -> Result<(), ValidationError> {
        if self.content_type != ContentType::File
            && self.content.chars().count() > MAX_MESSAGE_LENGTH
        {
            return Err(ValidationError::Oversized);
        }
        if self.is_expired() {
            return Err(ValidationError::Expired);
        }
        if pubkey_tag(&self.author_pubkey) != self.author_tag {
            return Err(ValidationError::TagMismatch);
        }
        if !verify_pow(&self.pow_preimage(), &self.nonce, &self.pow_hash, difficulty) {
            return Err(ValidationError::BadPow);
        }
        if !verify_hex(&self.author_pubkey, &self.signature, &self.sig_preimage()) {
            return Err(ValidationError::BadSignature);
        }
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        now_f64() >= self.timestamp + self.ttl as f64
    }

    pub fn remaining_secs(&self) -> u64 {
        let remaining = (self.timestamp + self.ttl as f64) - now_f64();
        if remaining > 0.0 { remaining as u64 } else { 0 }
    }

    /// `name#tag`.
    pub fn display_author(&self) -> String {
        format!("{}#{}", self.author_name, self.author_tag)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }

    pub fn from_json(raw: &str) -> Result<Message, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// =============================================================================
// PROOF OF WORK
// =============================================================================

/// True when the hash, read as a 256-bit big-endian integer, is strictly
/// below `2^(256 - difficulty)` — the leading `difficulty` bits are zero.
pub fn meets_difficulty(hash: &[u8; 32], difficulty: u32) -> bool {
    let mut remaining = difficulty;
    for byte in hash {
        if remaining == 0 {
            return true;
        }
        if remaining >= 8 {
            if *byte != 0 {
                return false;
            }
            remaining -= 8;
        } else {
            return *byte >> (8 - remaining) == 0;
        }
    }
    true
}

/// Hashcash mining: the smallest 64-bit nonce (big-endian encoded) whose
/// SHA-256 over `payload ∥ nonce` meets the difficulty. CPU-bound and
/// blocking; never call from an async task directly.
pub fn mine_pow(payload: &[u8], difficulty: u32) -> (String, String) {
    let mut n: u64 = 0;
    loop {
        let nonce = n.to_be_bytes();
        let hash = pow_hash(payload, &nonce);
        if meets_difficulty(&hash, difficulty) {
            return (hex::encode(nonce), hex::encode(hash));
        }
        n = n.wrapping_add(1);
    }
}

/// Recompute and check a claimed proof of work. Constant work: one hash.
pub fn verify_pow(payload: &[u8], nonce_hex: &str, pow_hash_hex: &str, difficulty: u32) -> bool {
    let Ok(nonce) = hex::decode(nonce_hex) else {
        return false;
    };
    let hash = pow_hash(payload, &nonce);
    hex::encode(hash) == pow_hash_hex && meets_difficulty(&hash, difficulty)
}

fn pow_hash(payload: &[u8], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(nonce);
    hasher.finalize().into()
}
