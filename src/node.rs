//! Node wiring: one identity, one store, one network, one UI channel.
//!
//! The UI boundary is exactly two callbacks in (`send`, `connect`) and an
//! event stream out. Both callbacks hand work to the runtime and return
//! immediately; mining never runs on the I/O executor.

use crate::crypto::Identity;
use crate::message::{Message, Outgoing};
use crate::net::{NetConfig, NetError, Network};
use crate::store::MessageStore;
use crate::types::{emit, UiEvent, UiReceiver, UiSender};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tcp_port: u16,
    pub relay_urls: Vec<String>,
    pub pow_difficulty: u32,
    pub discovery: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let net = NetConfig::default();
        Self {
            tcp_port: net.tcp_port,
            relay_urls: net.relay_urls,
            pow_difficulty: net.pow_difficulty,
            discovery: net.discovery,
        }
    }
}

pub struct Node {
    pub identity: Arc<Identity>,
    pub store: Arc<MessageStore>,
    pub network: Arc<Network>,
    events: UiSender,
    pow_difficulty: u32,
}

impl Node {
    /// Start listening, discovering and relaying. Returns the node handle
    /// and the UI event stream.
    pub async fn start(identity: Identity, cfg: NodeConfig) -> Result<(Node, UiReceiver), NetError> {
        let identity = Arc::new(identity);
        let store = Arc::new(MessageStore::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let net_cfg = NetConfig {
            tcp_port: cfg.tcp_port,
            relay_urls: cfg.relay_urls.clone(),
            pow_difficulty: cfg.pow_difficulty,
            discovery: cfg.discovery,
        };
        let network = Network::new(identity.clone(), store.clone(), events_tx.clone(), net_cfg);
        network.start().await?;

        Ok((
            Node {
                identity,
                store,
                network,
                events: events_tx,
                pow_difficulty: cfg.pow_difficulty,
            },
            events_rx,
        ))
    }

    /// UI send callback. Snapshots `last_hash`, mines and signs on a
    /// blocking worker, then admits and broadcasts. Returns immediately.
    pub fn send(&self, outgoing: Outgoing) {
        let identity = self.identity.clone();
        let store = self.store.clone();
        let network = self.network.clone();
        let events = self.events.clone();
        let difficulty = self.pow_difficulty;
        tokio::spawn(async move {
            let prev_hash = store.last_hash();
            let built = tokio::task::spawn_blocking(move || {
                Message::create(&identity, &prev_hash, outgoing, difficulty)
            })
            .await;
            match built {
                Ok(Ok(msg)) => network.submit_local(msg).await,
                Ok(Err(e)) => emit(&events, UiEvent::Error(e.to_string())),
                Err(_) => emit(&events, UiEvent::Error("message worker failed".to_string())),
            }
        });
    }

    /// UI connect callback. Dials in the background.
    pub fn connect(&self, host: String, port: u16) {
        let network = self.network.clone();
        tokio::spawn(async move {
            network.connect_to(&host, port).await;
        });
    }

    pub async fn shutdown(&self) {
        self.network.shutdown().await;
    }
}
