//! Shared types: time helpers and the network → UI event channel.

use crate::message::Message;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Current unix time in whole seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in fractional seconds. Message timestamps use this.
pub fn now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Events delivered from the core to the UI consumer.
///
/// The closed set of things a frontend can learn from the network. The UI
/// never reaches into network or store internals; it reads this channel
/// and the store's query methods.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A message from someone else was admitted to the store.
    NewMessage(Box<Message>),
    /// A locally authored message was mined, admitted and broadcast.
    MessageSent(Box<Message>),
    /// A TCP peer completed the handshake (`name#tag`).
    PeerJoined(String),
    /// A TCP peer was dropped (`name#tag`).
    PeerLeft(String),
    /// Informational status line.
    Status(String),
    /// Operator-visible error. Wire-level validation failures are silent
    /// and never surface here.
    Error(String),
    /// End-to-end encryption state for the relay path.
    E2e(bool),
}

pub type UiSender = mpsc::UnboundedSender<UiEvent>;
pub type UiReceiver = mpsc::UnboundedReceiver<UiEvent>;

/// Send an event, ignoring a closed UI side.
pub fn emit(tx: &UiSender, event: UiEvent) {
    let _ = tx.send(event);
}
