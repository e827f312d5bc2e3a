//! Relay privacy layer: untrusted WebSocket forwarding.

pub mod client;
pub mod rate_limit;
pub mod server;
pub mod wire;

pub use client::RelayClient;
pub use rate_limit::SlidingWindow;
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use wire::{RelayFrame, ScanEvent, SessionInfo};
