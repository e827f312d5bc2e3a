//! Blind WebSocket relay.
//!
//! Peers are random session UUIDs; message envelopes are forwarded without
//! inspection and never stored; every inter-session forward is delayed by
//! a uniform 50–300 ms draw to disrupt timing correlation. A second
//! WebSocket path (`/scan`) publishes counters only.
//!
//! All tables hang off one `RelayServer` value created at startup and
//! shared by the connection handlers — no process-wide state.

use crate::config::{
    FORWARD_DELAY_MS, MAX_FRAME_BYTES, RELAY_IDLE_TIMEOUT_SECS, RELAY_MAX_PEERS,
    RELAY_MAX_SCANNERS, RELAY_PORT_DEFAULT, RELAY_RATE_LIMIT_PER_SEC, RELAY_RATE_WINDOW_SECS,
};
use crate::relay::rate_limit::SlidingWindow;
use crate::relay::wire::{RelayFrame, ScanEvent, SessionInfo};
use crate::types::now_f64;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Operator wallet address broadcast to connecting peers. Optional;
    /// carries no machinery beyond the announcement.
    pub wallet: Option<String>,
    pub max_peers: usize,
    pub max_scanners: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: RELAY_PORT_DEFAULT,
            wallet: None,
            max_peers: RELAY_MAX_PEERS,
            max_scanners: RELAY_MAX_SCANNERS,
        }
    }
}

struct Session {
    curve_pk: String,
    tx: mpsc::UnboundedSender<String>,
}

/// Counter snapshot for status lines and tests.
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub peers_online: usize,
    pub scanners: usize,
    pub total_messages: u64,
    pub total_connections: u64,
}

pub struct RelayServer {
    cfg: RelayConfig,
    sessions: Mutex<HashMap<String, Session>>,
    scanners: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_scanner: AtomicU64,
    total_messages: AtomicU64,
    total_connections: AtomicU64,
    started: Instant,
}

impl RelayServer {
    pub fn new(cfg: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sessions: Mutex::new(HashMap::new()),
            scanners: Mutex::new(HashMap::new()),
            next_scanner: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            started: Instant::now(),
        })
    }

    /// Bind and start accepting. Returns the bound address (port 0 in the
    /// config picks a free one).
    pub async fn bind(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.cfg.host.as_str(), self.cfg.port)).await?;
        let addr = listener.local_addr()?;
        info!("relay listening on ws://{addr} (scanner at /scan)");
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(server.clone().handle_connection(stream));
                    }
                    Err(e) => {
                        debug!("relay accept error: {e}");
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(addr)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            peers_online: self.sessions.lock().unwrap().len(),
            scanners: self.scanners.lock().unwrap().len(),
            total_messages: self.total_messages.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::SeqCst),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_BYTES);
        ws_config.max_frame_size = Some(MAX_FRAME_BYTES);

        let mut path = String::from("/");
        let callback = |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws = match tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(ws_config),
        )
        .await
        {
            Ok(ws) => ws,
            Err(_) => return,
        };

        if path == "/scan" {
            self.handle_scanner(ws).await;
        } else {
            self.handle_peer(ws).await;
        }
    }

    // -------------------------------------------------------------------------
    // Peer sessions
    // -------------------------------------------------------------------------

    async fn handle_peer(self: Arc<Self>, ws: WebSocketStream<TcpStream>) {
        let (mut sink, mut stream) = ws.split();

        if self.sessions.lock().unwrap().len() >= self.cfg.max_peers {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: "relay full".into(),
                })))
                .await;
            return;
        }
        self.total_connections.fetch_add(1, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let mut session_id: Option<String> = None;
        let mut limiter = SlidingWindow::new(RELAY_RATE_LIMIT_PER_SEC, RELAY_RATE_WINDOW_SECS);

        loop {
            let item = match timeout(
                Duration::from_secs(RELAY_IDLE_TIMEOUT_SECS),
                stream.next(),
            )
            .await
            {
                Err(_) => break, // idle
                Ok(None) => break,
                Ok(Some(Err(_))) => break,
                Ok(Some(Ok(m))) => m,
            };
            let text = match item {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            if text.len() > MAX_FRAME_BYTES {
                continue;
            }
            if !limiter.allow() {
                continue;
            }
            let Ok(frame) = RelayFrame::parse(&text) else {
                continue;
            };

            match frame {
                RelayFrame::Hello { session, curve_pk } => {
                    let sid = self.install_session(session_id.take(), session, curve_pk, &tx);
                    session_id = Some(sid);
                }
                // Everything below requires an installed session.
                _ if session_id.is_none() => {}
                RelayFrame::Msg { .. } => {
                    self.total_messages.fetch_add(1, Ordering::SeqCst);
                    self.scan_broadcast(&ScanEvent::Activity { ts: now_f64() });
                    self.broadcast_delayed(session_id.as_deref().unwrap_or(""), text);
                }
                RelayFrame::KeyRequest { .. } => {
                    self.broadcast_delayed(session_id.as_deref().unwrap_or(""), text);
                }
                RelayFrame::KeyShare { ref to, .. } => {
                    // Direct forward to the addressed session only, no delay.
                    let target = self.sessions.lock().unwrap().get(to).map(|s| s.tx.clone());
                    if let Some(target) = target {
                        let _ = target.send(text);
                    }
                }
                RelayFrame::Heartbeat => {}
                // Server-vocabulary frames from a client are dropped.
                _ => {}
            }
        }

        if let Some(sid) = session_id {
            self.remove_session(&sid);
        }
        writer.abort();
    }

    /// Install (or replace) a session under a collision-free id, reply
    /// with the peer snapshot and announce the join to everyone else.
    fn install_session(
        self: &Arc<Self>,
        previous: Option<String>,
        proposed: String,
        curve_pk: String,
        tx: &mpsc::UnboundedSender<String>,
    ) -> String {
        let mut curve_pk = curve_pk;
        curve_pk.truncate(256);

        let (sid, peers, others, online) = {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(old) = previous {
                sessions.remove(&old);
            }
            let sid = if proposed.is_empty() || sessions.contains_key(&proposed) {
                Uuid::new_v4().to_string()
            } else {
                proposed
            };
            sessions.insert(
                sid.clone(),
                Session {
                    curve_pk: curve_pk.clone(),
                    tx: tx.clone(),
                },
            );
            let peers: Vec<SessionInfo> = sessions
                .iter()
                .filter(|(id, _)| **id != sid)
                .map(|(id, s)| SessionInfo {
                    session: id.clone(),
                    curve_pk: s.curve_pk.clone(),
                })
                .collect();
            let others: Vec<(String, mpsc::UnboundedSender<String>)> = sessions
                .iter()
                .filter(|(id, _)| **id != sid)
                .map(|(id, s)| (id.clone(), s.tx.clone()))
                .collect();
            (sid, peers, others, sessions.len())
        };

        let count = peers.len();
        let _ = tx.send(RelayFrame::RelayPeers { peers, count }.encode());
        if let Some(wallet) = &self.cfg.wallet {
            let _ = tx.send(
                RelayFrame::RelayWallet {
                    address: wallet.clone(),
                }
                .encode(),
            );
        }

        let join = RelayFrame::RelayJoin {
            session: sid.clone(),
            curve_pk,
            ts: now_f64(),
        }
        .encode();
        for (other_sid, other_tx) in others {
            self.delayed_forward(other_sid, other_tx, join.clone());
        }

        self.scan_broadcast(&ScanEvent::PeerJoin {
            peers_online: online,
            ts: now_f64(),
        });
        sid
    }

    /// Forward a raw frame to every session except the sender, each after
    /// its own random delay.
    fn broadcast_delayed(self: &Arc<Self>, from_sid: &str, payload: String) {
        let targets: Vec<(String, mpsc::UnboundedSender<String>)> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() != from_sid)
            .map(|(id, s)| (id.clone(), s.tx.clone()))
            .collect();
        for (sid, tx) in targets {
            self.delayed_forward(sid, tx, payload.clone());
        }
    }

    /// One forward after `uniform(50 ms, 300 ms)`. A dead receiver takes
    /// its session down and announces the leave.
    fn delayed_forward(
        self: &Arc<Self>,
        target_sid: String,
        tx: mpsc::UnboundedSender<String>,
        payload: String,
    ) {
        let delay = rand::thread_rng().gen_range(FORWARD_DELAY_MS.0..=FORWARD_DELAY_MS.1);
        let server = self.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            if tx.send(payload).is_err() {
                server.remove_session(&target_sid);
            }
        });
    }

    /// Drop a session and tell the remaining ones. Idempotent.
    fn remove_session(&self, sid: &str) {
        let (removed, remaining, online) = {
            let mut sessions = self.sessions.lock().unwrap();
            let removed = sessions.remove(sid).is_some();
            let remaining: Vec<mpsc::UnboundedSender<String>> =
                sessions.values().map(|s| s.tx.clone()).collect();
            (removed, remaining, sessions.len())
        };
        if !removed {
            return;
        }
        let leave = RelayFrame::RelayLeave {
            session: sid.to_string(),
        }
        .encode();
        for tx in remaining {
            let _ = tx.send(leave.clone());
        }
        self.scan_broadcast(&ScanEvent::PeerLeave {
            peers_online: online,
            ts: now_f64(),
        });
    }

    // -------------------------------------------------------------------------
    // Scanner feed
    // -------------------------------------------------------------------------

    async fn handle_scanner(self: Arc<Self>, ws: WebSocketStream<TcpStream>) {
        let (mut sink, mut stream) = ws.split();

        if self.scanners.lock().unwrap().len() >= self.cfg.max_scanners {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: "too many scanners".into(),
                })))
                .await;
            return;
        }

        let id = self.next_scanner.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.scanners.lock().unwrap().insert(id, tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let snapshot = ScanEvent::Snapshot {
            peers_online: self.sessions.lock().unwrap().len(),
            total_messages: self.total_messages.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::SeqCst),
            uptime: self.started.elapsed().as_secs_f64(),
            relay_wallet: self.cfg.wallet.clone(),
        };
        let _ = tx.send(snapshot.encode());

        // Scanners only listen; drain until they hang up.
        while let Some(Ok(msg)) = stream.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }

        self.scanners.lock().unwrap().remove(&id);
        writer.abort();
    }

    fn scan_broadcast(&self, event: &ScanEvent) {
        let mut scanners = self.scanners.lock().unwrap();
        if scanners.is_empty() {
            return;
        }
        let encoded = event.encode();
        scanners.retain(|_, tx| tx.send(encoded.clone()).is_ok());
    }
}
