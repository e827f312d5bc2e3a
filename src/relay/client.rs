//! Relay client: anonymous session, room-key exchange, envelope traffic.
//!
//! The relay is untrusted. Nothing identifying leaves this module: the
//! session id is a throwaway UUID, the only key material on the wire is
//! the X25519 public key, and message payloads are secret-box envelopes.
//! The session id and curve keypair persist across reconnects.

use crate::config::{KEY_EXCHANGE_TIMEOUT_SECS, RELAY_RECONNECT_SECS};
use crate::crypto::Identity;
use crate::e2e::{
    curve_public_hex, curve_secret, decrypt_envelope, encrypt_envelope, generate_room_key,
    seal_room_key, unseal_room_key, RoomKey,
};
use crate::latch::Latch;
use crate::message::Message;
use crate::relay::wire::RelayFrame;
use crate::types::{emit, UiEvent, UiSender};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;
use uuid::Uuid;
use x25519_dalek::StaticSecret;

/// Decrypted messages handed back to the admission pipeline, tagged with
/// the relay they arrived on (gossip must not echo them back there).
pub type RelayInbound = (String, Message);

pub struct RelayClient {
    session: String,
    curve_secret: StaticSecret,
    curve_pk_hex: String,
    room_key: Mutex<Option<RoomKey>>,
    key_ready: Latch,
    conns: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    wallet: Mutex<Option<String>>,
    events: UiSender,
    inbound: mpsc::UnboundedSender<RelayInbound>,
    running: Arc<AtomicBool>,
}

impl RelayClient {
    pub fn new(
        identity: &Identity,
        events: UiSender,
        running: Arc<AtomicBool>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RelayInbound>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            session: Uuid::new_v4().to_string(),
            curve_secret: curve_secret(identity),
            curve_pk_hex: curve_public_hex(identity),
            room_key: Mutex::new(None),
            key_ready: Latch::new(),
            conns: Mutex::new(HashMap::new()),
            wallet: Mutex::new(None),
            events,
            inbound: inbound_tx,
            running,
        });
        (client, inbound_rx)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// E2E is active once a room key is held, shared or self-generated.
    pub fn is_e2e(&self) -> bool {
        self.room_key.lock().unwrap().is_some()
    }

    pub fn room_key(&self) -> Option<RoomKey> {
        *self.room_key.lock().unwrap()
    }

    pub fn relay_wallet(&self) -> Option<String> {
        self.wallet.lock().unwrap().clone()
    }

    pub fn connected_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Dial one relay and keep it dialled: 5 s backoff, unbounded retries,
    /// for as long as the node runs.
    pub async fn connect_loop(self: Arc<Self>, url: String) {
        while self.running.load(Ordering::SeqCst) {
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    emit(&self.events, UiEvent::Status("relay connected".to_string()));
                    self.run_session(&url, ws).await;
                }
                Err(e) => {
                    debug!("relay {url} unreachable: {e}");
                }
            }
            self.conns.lock().unwrap().remove(&url);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            sleep(Duration::from_secs(RELAY_RECONNECT_SECS)).await;
        }
    }

    async fn run_session<S>(self: &Arc<Self>, url: &str, ws: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.conns.lock().unwrap().insert(url.to_string(), tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Anonymous hello: session + curve key, nothing else.
        let hello = RelayFrame::Hello {
            session: self.session.clone(),
            curve_pk: self.curve_pk_hex.clone(),
        };
        let _ = tx.send(hello.encode());

        while self.running.load(Ordering::SeqCst) {
            let msg = match stream.next().await {
                Some(Ok(m)) => m,
                _ => break,
            };
            let text = match msg {
                WsMessage::Text(t) => t,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let Ok(frame) = RelayFrame::parse(&text) else {
                continue;
            };
            self.dispatch(url, frame, &tx).await;
        }

        self.conns.lock().unwrap().remove(url);
        writer.abort();
    }

    async fn dispatch(
        self: &Arc<Self>,
        url: &str,
        frame: RelayFrame,
        tx: &mpsc::UnboundedSender<String>,
    ) {
        match frame {
            RelayFrame::RelayPeers { peers, count } => {
                if count > 0 {
                    emit(
                        &self.events,
                        UiEvent::Status(format!("relay: {count} peers online")),
                    );
                }
                if peers.is_empty() {
                    // Alone on the relay: the room key is ours to mint.
                    self.adopt_own_key();
                } else if self.room_key.lock().unwrap().is_none() {
                    let request = RelayFrame::KeyRequest {
                        session: self.session.clone(),
                        curve_pk: self.curve_pk_hex.clone(),
                    };
                    let _ = tx.send(request.encode());
                    self.spawn_key_timeout();
                }
            }

            RelayFrame::RelayJoin {
                session, curve_pk, ..
            } => {
                emit(&self.events, UiEvent::PeerJoined("relay peer".to_string()));
                // Holders seal the room key to newcomers unprompted.
                if session != self.session && !curve_pk.is_empty() {
                    self.share_key_with(&session, &curve_pk, tx);
                }
            }

            RelayFrame::RelayLeave { .. } => {
                emit(&self.events, UiEvent::PeerLeft("relay peer".to_string()));
            }

            RelayFrame::KeyShare { sealed, .. } => {
                if self.room_key.lock().unwrap().is_some() {
                    return;
                }
                match unseal_room_key(&sealed, &self.curve_secret) {
                    Ok(key) => self.install_key(key),
                    Err(_) => debug!("discarding key share we cannot open"),
                }
            }

            RelayFrame::KeyRequest { session, curve_pk } => {
                if session != self.session && !curve_pk.is_empty() {
                    self.share_key_with(&session, &curve_pk, tx);
                }
            }

            RelayFrame::Msg { envelope } => {
                let Some(key) = *self.room_key.lock().unwrap() else {
                    return;
                };
                // Undecryptable envelopes are dropped; the channel stays up.
                let Ok(plaintext) = decrypt_envelope(&envelope, &key) else {
                    return;
                };
                let Ok(text) = String::from_utf8(plaintext) else {
                    return;
                };
                let Ok(msg) = Message::from_json(&text) else {
                    return;
                };
                let _ = self.inbound.send((url.to_string(), msg));
            }

            RelayFrame::RelayWallet { address } => {
                *self.wallet.lock().unwrap() = Some(address);
            }

            // Peer-vocabulary frames echoed at us: nothing to do.
            RelayFrame::Hello { .. } | RelayFrame::Heartbeat => {}
        }
    }

    fn share_key_with(&self, session: &str, curve_pk: &str, tx: &mpsc::UnboundedSender<String>) {
        let Some(key) = *self.room_key.lock().unwrap() else {
            return;
        };
        match seal_room_key(&key, curve_pk) {
            Ok(sealed) => {
                let share = RelayFrame::KeyShare {
                    to: session.to_string(),
                    sealed,
                };
                let _ = tx.send(share.encode());
            }
            Err(_) => debug!("cannot seal room key to malformed curve_pk"),
        }
    }

    /// Hold the first room key seen; later candidates are ignored.
    fn install_key(&self, key: RoomKey) {
        let mut slot = self.room_key.lock().unwrap();
        if slot.is_none() {
            *slot = Some(key);
            drop(slot);
            self.key_ready.set();
            emit(&self.events, UiEvent::E2e(true));
        }
    }

    fn adopt_own_key(&self) {
        self.install_key(generate_room_key());
    }

    /// Fall back to a self-generated key if no share arrives in time.
    fn spawn_key_timeout(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            let wait = timeout(
                Duration::from_secs(KEY_EXCHANGE_TIMEOUT_SECS),
                client.key_ready.wait(),
            );
            if wait.await.is_err() {
                client.adopt_own_key();
            }
        });
    }

    /// Encrypt and queue a message on every connected relay, except the
    /// one it came from.
    pub async fn broadcast(&self, msg: &Message, exclude: Option<&str>) {
        let Some(key) = *self.room_key.lock().unwrap() else {
            return;
        };
        let Ok(envelope) = encrypt_envelope(msg.to_json().as_bytes(), &key) else {
            return;
        };
        let payload = RelayFrame::Msg { envelope }.encode();
        let conns: Vec<(String, mpsc::UnboundedSender<String>)> = self
            .conns
            .lock()
            .unwrap()
            .iter()
            .map(|(u, tx)| (u.clone(), tx.clone()))
            .collect();
        for (url, tx) in conns {
            if exclude == Some(url.as_str()) {
                continue;
            }
            let _ = tx.send(payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::wire::SessionInfo;

    fn client() -> (
        Arc<RelayClient>,
        mpsc::UnboundedReceiver<RelayInbound>,
        mpsc::UnboundedReceiver<UiEvent>,
    ) {
        let identity = Identity::generate("ada");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let (client, inbound_rx) = RelayClient::new(&identity, events_tx, running);
        (client, inbound_rx, events_rx)
    }

    #[tokio::test]
    async fn alone_on_relay_generates_own_key_without_requesting() {
        let (client, _inbound, _events) = client();
        let (tx, mut outgoing) = mpsc::unbounded_channel();

        let frame = RelayFrame::RelayPeers {
            peers: vec![],
            count: 0,
        };
        client.dispatch("ws://r", frame, &tx).await;

        assert!(client.is_e2e());
        assert!(outgoing.try_recv().is_err(), "no key_request may be sent");
    }

    #[tokio::test]
    async fn peers_present_triggers_key_request() {
        let (client, _inbound, _events) = client();
        let (tx, mut outgoing) = mpsc::unbounded_channel();

        let frame = RelayFrame::RelayPeers {
            peers: vec![SessionInfo {
                session: "other".into(),
                curve_pk: "aa".repeat(32),
            }],
            count: 1,
        };
        client.dispatch("ws://r", frame, &tx).await;

        assert!(!client.is_e2e());
        let sent = outgoing.try_recv().unwrap();
        assert!(sent.contains(r#""type":"key_request""#));
    }

    #[tokio::test]
    async fn key_share_unseals_and_sticks() {
        let identity = Identity::generate("ada");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let (client, _inbound) = RelayClient::new(&identity, events_tx, running);
        let (tx, _outgoing) = mpsc::unbounded_channel();

        let key = generate_room_key();
        let sealed = seal_room_key(&key, &curve_public_hex(&identity)).unwrap();
        let frame = RelayFrame::KeyShare {
            to: client.session().to_string(),
            sealed,
        };
        client.dispatch("ws://r", frame, &tx).await;
        assert_eq!(client.room_key(), Some(key));

        // A second share must not replace the installed key.
        let other = generate_room_key();
        let sealed = seal_room_key(&other, &curve_public_hex(&identity)).unwrap();
        let frame = RelayFrame::KeyShare {
            to: client.session().to_string(),
            sealed,
        };
        client.dispatch("ws://r", frame, &tx).await;
        assert_eq!(client.room_key(), Some(key));
    }

    #[tokio::test]
    async fn key_request_is_answered_with_sealed_share() {
        let (client, _inbound, _events) = client();
        let (tx, mut outgoing) = mpsc::unbounded_channel();
        client.adopt_own_key();

        let requester = Identity::generate("bob");
        let frame = RelayFrame::KeyRequest {
            session: "bob-session".into(),
            curve_pk: curve_public_hex(&requester),
        };
        client.dispatch("ws://r", frame, &tx).await;

        let sent = outgoing.try_recv().unwrap();
        let parsed = RelayFrame::parse(&sent).unwrap();
        match parsed {
            RelayFrame::KeyShare { to, sealed } => {
                assert_eq!(to, "bob-session");
                let opened = unseal_room_key(&sealed, &curve_secret(&requester)).unwrap();
                assert_eq!(Some(opened), client.room_key());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn own_key_request_echo_is_ignored() {
        let (client, _inbound, _events) = client();
        let (tx, mut outgoing) = mpsc::unbounded_channel();
        client.adopt_own_key();

        let frame = RelayFrame::KeyRequest {
            session: client.session().to_string(),
            curve_pk: client.curve_pk_hex.clone(),
        };
        client.dispatch("ws://r", frame, &tx).await;
        assert!(outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn envelopes_decrypt_into_inbound_channel() {
        let (client, mut inbound, _events) = client();
        let (tx, _outgoing) = mpsc::unbounded_channel();
        client.adopt_own_key();
        let key = client.room_key().unwrap();

        let author = Identity::generate("bob");
        let msg = Message::create(
            &author,
            crate::message::GENESIS_PREV_HASH,
            crate::message::Outgoing::text("over the relay"),
            8,
        )
        .unwrap();
        let envelope = encrypt_envelope(msg.to_json().as_bytes(), &key).unwrap();
        client
            .dispatch("ws://r", RelayFrame::Msg { envelope }, &tx)
            .await;

        let (url, received) = inbound.try_recv().unwrap();
        assert_eq!(url, "ws://r");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn undecryptable_envelope_is_dropped_silently() {
        let (client, mut inbound, _events) = client();
        let (tx, _outgoing) = mpsc::unbounded_channel();
        client.adopt_own_key();

        let foreign = encrypt_envelope(b"{}", &generate_room_key()).unwrap();
        client
            .dispatch("ws://r", RelayFrame::Msg { envelope: foreign }, &tx)
            .await;
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn wallet_announcement_is_recorded() {
        let (client, _inbound, _events) = client();
        let (tx, _outgoing) = mpsc::unbounded_channel();
        client
            .dispatch(
                "ws://r",
                RelayFrame::RelayWallet {
                    address: "0xabc".into(),
                },
                &tx,
            )
            .await;
        assert_eq!(client.relay_wallet().as_deref(), Some("0xabc"));
    }
}
