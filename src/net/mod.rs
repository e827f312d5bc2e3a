//! P2P networking layer.

pub mod discovery;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use discovery::Discovered;
pub use peer::{Peer, PeerInfo};
pub use protocol::{NetConfig, NetError, Network, Source};
pub use wire::Frame;
