//! The peer network: TCP listener and dialer, symmetric handshake, store
//! sync, gossip, heartbeats and background maintenance.
//!
//! One `Network` value owns the peer table, the claimed-names map and the
//! dedupe set. Outbound frames to a peer go through that peer's writer
//! channel, so writes never interleave; inbound frames are admitted
//! through a single pipeline shared by TCP and relay sources.

use crate::config::{
    HANDSHAKE_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, MAX_FRAME_BYTES, POW_DIFFICULTY,
    PRUNE_INTERVAL_SECS, RELAY_SERVERS, SEEN_IDS_MAX, TCP_BIND_ATTEMPTS, TCP_PORT_DEFAULT,
};
use crate::crypto::Identity;
use crate::message::Message;
use crate::net::discovery::{self, Discovered};
use crate::net::peer::{Peer, PeerInfo};
use crate::net::wire::Frame;
use crate::relay::client::{RelayClient, RelayInbound};
use crate::store::MessageStore;
use crate::types::{emit, UiEvent, UiSender};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("could not bind a TCP port")]
    Bind,
}

/// Where an inbound message entered this process. Gossip excludes the
/// source so a message never echoes back on the transport it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Authored locally.
    Local,
    /// Received from a TCP peer (`name#tag`).
    Peer(String),
    /// Received from a relay (url).
    Relay(String),
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub tcp_port: u16,
    pub relay_urls: Vec<String>,
    pub pow_difficulty: u32,
    /// LAN multicast discovery; off for tests that must not touch the LAN.
    pub discovery: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_port: TCP_PORT_DEFAULT,
            relay_urls: RELAY_SERVERS.iter().map(|s| s.to_string()).collect(),
            pow_difficulty: POW_DIFFICULTY,
            discovery: true,
        }
    }
}

pub struct Network {
    identity: Arc<Identity>,
    store: Arc<MessageStore>,
    events: UiSender,
    cfg: NetConfig,
    /// Bound listen port, known after `start`.
    tcp_port: AtomicU16,
    peers: Mutex<HashMap<String, Peer>>,
    /// Monotonic name → pubkey bindings. An entry leaves only when the
    /// peer owning it drops.
    claimed_names: Mutex<HashMap<String, String>>,
    seen_ids: Mutex<HashSet<String>>,
    running: Arc<AtomicBool>,
    shutdown: Notify,
    relay: Arc<RelayClient>,
    relay_inbound: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RelayInbound>>>,
}

impl Network {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<MessageStore>,
        events: UiSender,
        cfg: NetConfig,
    ) -> Arc<Self> {
        let running = Arc::new(AtomicBool::new(false));
        let (relay, relay_inbound) = RelayClient::new(&identity, events.clone(), running.clone());
        Arc::new(Self {
            identity,
            store,
            events,
            cfg,
            tcp_port: AtomicU16::new(0),
            peers: Mutex::new(HashMap::new()),
            claimed_names: Mutex::new(HashMap::new()),
            seen_ids: Mutex::new(HashSet::new()),
            running,
            shutdown: Notify::new(),
            relay,
            relay_inbound: std::sync::Mutex::new(Some(relay_inbound)),
        })
    }

    pub fn relay(&self) -> &Arc<RelayClient> {
        &self.relay
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::SeqCst)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.lock().await.values().map(PeerInfo::from).collect()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Bind a listener, start every background task, return the bound
    /// port. Our own name is claimed before any frame can contest it.
    pub async fn start(self: &Arc<Self>) -> Result<u16, NetError> {
        self.running.store(true, Ordering::SeqCst);
        self.claimed_names
            .lock()
            .await
            .insert(self.identity.name.clone(), self.identity.pubkey_hex());

        let listener = self.bind_listener().await?;
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.cfg.tcp_port);
        self.tcp_port.store(port, Ordering::SeqCst);

        let net = self.clone();
        tokio::spawn(async move { net.accept_loop(listener).await });

        if self.cfg.discovery {
            self.start_discovery(port);
        }

        let net = self.clone();
        tokio::spawn(async move { net.heartbeat_loop().await });
        let net = self.clone();
        tokio::spawn(async move { net.prune_loop().await });

        // Relay ingest: decrypted envelopes re-enter the common pipeline.
        if let Some(mut inbound) = self.relay_inbound.lock().unwrap().take() {
            let net = self.clone();
            tokio::spawn(async move {
                while let Some((url, msg)) = inbound.recv().await {
                    net.ingest(msg, Source::Relay(url)).await;
                }
            });
        }

        for url in &self.cfg.relay_urls {
            tokio::spawn(self.relay.clone().connect_loop(url.clone()));
        }

        emit(
            &self.events,
            UiEvent::Status(format!("listening on port {port}")),
        );
        Ok(port)
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        // Dropping the peers closes their writer channels; writer tasks
        // exit and the sockets go down with them.
        self.peers.lock().await.clear();
        self.claimed_names.lock().await.clear();
    }

    async fn bind_listener(&self) -> Result<TcpListener, NetError> {
        // Port 0 asks the OS for any free port (tests); otherwise scan
        // the configured port and the next few above it.
        if self.cfg.tcp_port == 0 {
            return TcpListener::bind(("0.0.0.0", 0)).await.map_err(|_| {
                emit(&self.events, UiEvent::Error("could not bind TCP port".into()));
                NetError::Bind
            });
        }
        for offset in 0..TCP_BIND_ATTEMPTS {
            let port = self.cfg.tcp_port + offset;
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                return Ok(listener);
            }
        }
        emit(&self.events, UiEvent::Error("could not bind TCP port".into()));
        Err(NetError::Bind)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let net = self.clone();
                        tokio::spawn(async move { net.handshake(stream, addr).await });
                    }
                    Err(e) => {
                        debug!("accept error: {e}");
                        sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    fn start_discovery(self: &Arc<Self>, port: u16) {
        let announce = Frame::Discover {
            name: self.identity.name.clone(),
            tag: self.identity.tag(),
            pubkey: self.identity.pubkey_hex(),
            tcp_port: port,
        };
        tokio::spawn(discovery::announce(announce, self.running.clone()));

        let (found_tx, mut found_rx) = mpsc::unbounded_channel::<Discovered>();
        tokio::spawn(discovery::listen(
            self.identity.pubkey_hex(),
            found_tx,
            self.running.clone(),
        ));
        let net = self.clone();
        tokio::spawn(async move {
            while let Some(found) = found_rx.recv().await {
                if net.peers.lock().await.contains_key(&found.peer_id) {
                    continue;
                }
                let net = net.clone();
                tokio::spawn(async move {
                    net.connect_to(&found.addr.ip().to_string(), found.addr.port())
                        .await;
                });
            }
        });
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Dial a peer. Already-connected addresses are skipped quietly;
    /// connection failure surfaces as a UI error and is not retried (the
    /// peer will be rediscovered or redialled by the user).
    pub async fn connect_to(self: &Arc<Self>, host: &str, port: u16) {
        {
            let peers = self.peers.lock().await;
            let already = peers
                .values()
                .any(|p| p.addr.ip().to_string() == host && p.addr.port() == port);
            if already {
                return;
            }
        }
        match TcpStream::connect((host, port)).await {
            Ok(stream) => {
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));
                self.clone().handshake(stream, addr).await;
            }
            Err(e) => {
                debug!("connect to {host}:{port} failed: {e}");
                emit(&self.events, UiEvent::Error("peer connection failed".into()));
            }
        }
    }

    /// Symmetric hello exchange: write ours, read theirs within the
    /// timeout, then vet and install the peer and replay our store to it.
    async fn handshake(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (read_half, mut write_half) = stream.into_split();

        let hello = Frame::Hello {
            name: self.identity.name.clone(),
            tag: self.identity.tag(),
            pubkey: self.identity.pubkey_hex(),
            tcp_port: self.tcp_port(),
        };
        if write_line(&mut write_half, &hello.encode()).await.is_err() {
            return;
        }

        let mut framed = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        );
        let first = timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), framed.next()).await;
        let line = match first {
            Ok(Some(Ok(line))) => line,
            // Timeout, EOF or transport error: close silently.
            _ => return,
        };
        let Ok(Frame::Hello {
            name,
            tag,
            pubkey,
            tcp_port: _,
        }) = Frame::parse(&line)
        else {
            return;
        };

        if pubkey == self.identity.pubkey_hex() {
            // Ourselves, usually via our own multicast announcement.
            return;
        }
        let peer_id = format!("{name}#{tag}");

        // Vet and install under both locks so concurrent handshakes from
        // the same identity cannot both pass.
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(&peer_id) {
                return;
            }
            let mut names = self.claimed_names.lock().await;
            if let Some(existing) = names.get(&name) {
                if existing != &pubkey {
                    let reject = Frame::NameTaken { name: name.clone() };
                    let _ = write_line(&mut write_half, &reject.encode()).await;
                    return;
                }
            }
            names.insert(name.clone(), pubkey.clone());
            peers.insert(
                peer_id.clone(),
                Peer::new(name, tag, pubkey, addr, tx.clone()),
            );
        }

        let net = self.clone();
        let writer_peer = peer_id.clone();
        tokio::spawn(async move { net.writer_loop(write_half, rx, writer_peer).await });

        // Sync: replay the full store, oldest first, before any gossip
        // can reach this peer's channel.
        for msg in self.store.get_all() {
            let frame = Frame::Msg {
                data: Box::new(msg),
            };
            if tx.send(frame.encode()).is_err() {
                break;
            }
        }

        emit(&self.events, UiEvent::PeerJoined(peer_id.clone()));
        info!("peer connected: {peer_id} ({addr})");

        let net = self.clone();
        tokio::spawn(async move { net.listen_loop(framed, peer_id).await });
    }

    /// Drain the outbound channel onto the socket. Any write failure
    /// drops the peer.
    async fn writer_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<String>,
        peer_id: String,
    ) {
        while let Some(line) = rx.recv().await {
            if write_line(&mut write_half, &line).await.is_err() {
                self.drop_peer(&peer_id).await;
                return;
            }
        }
        // Channel closed: the peer was removed elsewhere.
    }

    /// Read NDJSON frames until EOF or error. Oversized lines and parse
    /// failures skip the frame only.
    async fn listen_loop(
        self: Arc<Self>,
        mut framed: FramedRead<OwnedReadHalf, LinesCodec>,
        peer_id: String,
    ) {
        while self.running.load(Ordering::SeqCst) {
            match framed.next().await {
                None => break,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => continue,
                Some(Err(_)) => break,
                Some(Ok(line)) => {
                    if let Some(peer) = self.peers.lock().await.get_mut(&peer_id) {
                        peer.touch();
                    }
                    match Frame::parse(&line) {
                        Ok(frame) => self.handle_frame(frame, &peer_id).await,
                        Err(_) => continue,
                    }
                }
            }
        }
        self.drop_peer(&peer_id).await;
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame, peer_id: &str) {
        match frame {
            Frame::Msg { data } => {
                self.ingest(*data, Source::Peer(peer_id.to_string())).await;
            }
            Frame::Heartbeat { .. } => {}
            Frame::NameTaken { name } => {
                emit(
                    &self.events,
                    UiEvent::Error(format!("name '{name}' is taken on the network")),
                );
            }
            // Hello after handshake and discover on TCP are protocol noise.
            Frame::Hello { .. } | Frame::Discover { .. } => {}
        }
    }

    /// Remove a peer and release its name binding if it still owns it.
    pub async fn drop_peer(&self, peer_id: &str) {
        let removed = self.peers.lock().await.remove(peer_id);
        if let Some(peer) = removed {
            let mut names = self.claimed_names.lock().await;
            if names.get(&peer.name).is_some_and(|pk| pk == &peer.pubkey) {
                names.remove(&peer.name);
            }
            drop(names);
            emit(&self.events, UiEvent::PeerLeft(peer_id.to_string()));
            info!("peer dropped: {peer_id}");
        }
    }

    // -------------------------------------------------------------------------
    // Admission & gossip
    // -------------------------------------------------------------------------

    /// Common admission pipeline for every transport: dedupe, loopback,
    /// validation (off the I/O executor), name binding, store, UI event,
    /// gossip-except-source. Every rejection is silent on the wire.
    pub async fn ingest(self: &Arc<Self>, msg: Message, source: Source) {
        {
            let mut seen = self.seen_ids.lock().await;
            if !seen.insert(msg.id.clone()) {
                return;
            }
        }
        if msg.author_pubkey == self.identity.pubkey_hex() {
            return; // our own message looping back
        }

        let difficulty = self.cfg.pow_difficulty;
        let validated = tokio::task::spawn_blocking(move || match msg.validate(difficulty) {
            Ok(()) => Ok(msg),
            Err(reason) => Err(reason),
        })
        .await;
        let msg = match validated {
            Ok(Ok(msg)) => msg,
            Ok(Err(reason)) => {
                debug!("rejected message: {reason}");
                return;
            }
            Err(_) => return,
        };

        {
            let mut names = self.claimed_names.lock().await;
            match names.get(&msg.author_name) {
                Some(pk) if pk != &msg.author_pubkey => {
                    debug!("rejected message: name bound to another key");
                    return;
                }
                Some(_) => {}
                None => {
                    names.insert(msg.author_name.clone(), msg.author_pubkey.clone());
                }
            }
        }

        if self.store.add(&msg) {
            emit(&self.events, UiEvent::NewMessage(Box::new(msg.clone())));
            self.gossip(&msg, &source).await;
        }
    }

    /// Admit and broadcast a locally authored, already mined and signed
    /// message. The store decides exactly once whether it is new, so it
    /// is gossiped at most once.
    pub async fn submit_local(self: &Arc<Self>, msg: Message) {
        self.seen_ids.lock().await.insert(msg.id.clone());
        if self.store.add(&msg) {
            emit(&self.events, UiEvent::MessageSent(Box::new(msg.clone())));
            self.gossip(&msg, &Source::Local).await;
        }
    }

    /// Forward to every TCP peer and every relay, except the transport
    /// the message arrived on.
    async fn gossip(&self, msg: &Message, source: &Source) {
        let frame = Frame::Msg {
            data: Box::new(msg.clone()),
        };
        let line = frame.encode();
        {
            let peers = self.peers.lock().await;
            for (id, peer) in peers.iter() {
                if matches!(source, Source::Peer(src) if src == id) {
                    continue;
                }
                // A full channel cannot happen (unbounded); a closed one
                // means the writer task is already tearing the peer down.
                peer.send(&line);
            }
        }
        let exclude = match source {
            Source::Relay(url) => Some(url.as_str()),
            _ => None,
        };
        self.relay.broadcast(msg, exclude).await;
    }

    // -------------------------------------------------------------------------
    // Background maintenance
    // -------------------------------------------------------------------------

    /// Heartbeat every peer and drop the silent ones.
    async fn heartbeat_loop(self: Arc<Self>) {
        let line = Frame::Heartbeat {
            name: Some(self.identity.name.clone()),
            tag: Some(self.identity.tag()),
        }
        .encode();
        while self.running.load(Ordering::SeqCst) {
            sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)).await;
            let stale: Vec<String> = {
                let peers = self.peers.lock().await;
                peers
                    .iter()
                    .filter(|(_, p)| !p.is_alive())
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in stale {
                warn!("peer timed out: {id}");
                self.drop_peer(&id).await;
            }
            let peers = self.peers.lock().await;
            for peer in peers.values() {
                peer.send(&line);
            }
        }
    }

    /// Sweep expired messages and cap the dedupe set.
    async fn prune_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            sleep(Duration::from_secs(PRUNE_INTERVAL_SECS)).await;
            self.store.prune();
            let mut seen = self.seen_ids.lock().await;
            if seen.len() > SEEN_IDS_MAX {
                seen.clear();
            }
        }
    }
}

async fn write_line(write_half: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    write_half.write_all(&buf).await
}
