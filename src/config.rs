//! Protocol constants and per-user data paths.
//!
//! Every limit and interval of the wire protocol lives here; the network
//! and relay modules must not hardcode sizes or timeouts elsewhere.

use std::net::Ipv4Addr;
use std::path::PathBuf;

// =============================================================================
// MESSAGE PARAMETERS
// =============================================================================

/// Message lifetime in seconds. Expired messages are rejected at admission
/// and pruned from the store.
pub const MESSAGE_TTL_SECS: u64 = 1440;

/// Maximum content length in characters. File messages are exempt
/// (their payload rides in `file_data`, not `content`).
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Hashcash difficulty: leading zero bits required of the PoW hash.
/// 20 bits targets roughly one second of CPU per message.
pub const POW_DIFFICULTY: u32 = 20;

// =============================================================================
// TCP / LAN
// =============================================================================

/// First TCP listen port tried. Binding scans this port and the next
/// `TCP_BIND_ATTEMPTS - 1` above it.
pub const TCP_PORT_DEFAULT: u16 = 4201;

/// Ports tried before bind failure is reported as fatal.
pub const TCP_BIND_ATTEMPTS: u16 = 10;

/// Maximum NDJSON line on the TCP transport. Longer frames are skipped
/// without closing the connection.
pub const MAX_FRAME_BYTES: usize = 65536;

/// Hello exchange must complete within this many seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Seconds between heartbeat frames to every live peer.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A peer silent for longer than this is dropped.
pub const PEER_TIMEOUT_SECS: u64 = 90;

/// Seconds between expired-message sweeps and seen-id housekeeping.
pub const PRUNE_INTERVAL_SECS: u64 = 10;

/// The dedupe set is cleared once it grows past this many ids.
pub const SEEN_IDS_MAX: usize = 10_000;

// =============================================================================
// MULTICAST DISCOVERY
// =============================================================================

/// LAN discovery multicast group.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 42, 42, 42);

/// LAN discovery UDP port.
pub const MULTICAST_PORT: u16 = 4200;

/// Seconds between discovery announcements.
pub const ANNOUNCE_INTERVAL_SECS: u64 = 10;

/// Maximum UDP datagram accepted on the discovery socket.
pub const MAX_DATAGRAM_BYTES: usize = 2048;

// =============================================================================
// RELAY
// =============================================================================

/// Relay servers dialled by default. Anyone can run one with `ember relay`.
pub const RELAY_SERVERS: &[&str] = &["wss://relay.ember.network"];

/// Default listen port for `ember relay`.
pub const RELAY_PORT_DEFAULT: u16 = 4210;

/// Seconds between reconnect attempts to a relay.
pub const RELAY_RECONNECT_SECS: u64 = 5;

/// Seconds to wait for a shared room key before generating our own.
pub const KEY_EXCHANGE_TIMEOUT_SECS: u64 = 10;

/// Maximum peer connections a relay accepts.
pub const RELAY_MAX_PEERS: usize = 500;

/// Maximum scanner connections a relay accepts.
pub const RELAY_MAX_SCANNERS: usize = 20;

/// Frames per second allowed per relay session (sliding window).
pub const RELAY_RATE_LIMIT_PER_SEC: usize = 10;

/// Width of the rate-limit window in seconds.
pub const RELAY_RATE_WINDOW_SECS: f64 = 1.0;

/// Idle relay sessions are dropped after this many seconds.
pub const RELAY_IDLE_TIMEOUT_SECS: u64 = 300;

/// Inter-session forwards are delayed by a uniform draw from this range
/// (milliseconds) to disrupt timing correlation.
pub const FORWARD_DELAY_MS: (u64, u64) = (50, 300);

// =============================================================================
// DATA DIRECTORY
// =============================================================================

/// Per-user data directory (`~/.ember`).
pub fn data_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".ember")
}

/// Identity file: `{name, signing_key_hex}`, mode 0600.
pub fn identity_path() -> PathBuf {
    data_dir().join("identity.json")
}

/// Saved peers file: `[[host, port], …]`.
pub fn peers_path() -> PathBuf {
    data_dir().join("peers.json")
}
