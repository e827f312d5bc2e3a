pub mod config;
pub mod crypto;
pub mod e2e;
pub mod latch;
pub mod message;
pub mod net;
pub mod node;
pub mod relay;
pub mod store;
pub mod types;

pub use crypto::{load_identity, save_identity, validate_name, Identity};
pub use latch::Latch;
pub use message::{mine_pow, verify_pow, ContentType, Message, Outgoing};
pub use net::{NetConfig, NetError, Network, Source};
pub use node::{Node, NodeConfig};
pub use relay::{RelayClient, RelayConfig, RelayServer};
pub use store::{MessageStore, ThreadSummary};
pub use types::{UiEvent, UiReceiver, UiSender};
