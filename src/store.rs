//! Deduplicating store of live messages, indexed on demand by board and
//! thread. The only authoritative shared state in the process: a single
//! mutex guards both maps and `last_hash`, and every accessor returns
//! owned snapshots — no references into the interior escape.
//!
//! Volume is bounded by PoW cost (≈ one message per second per peer) and
//! the 24-minute TTL window, so one mutex is enough.

use crate::message::{Message, GENESIS_PREV_HASH};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Aggregated view of one thread, for board listings.
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub title: String,
    pub count: usize,
    pub latest: f64,
    pub preview: String,
    pub preview_author: String,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<String, Message>,
    direct: HashMap<String, Message>,
    last_hash: String,
}

pub struct MessageStore {
    inner: Mutex<Inner>,
    on_new: Mutex<Vec<Callback>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: HashMap::new(),
                direct: HashMap::new(),
                last_hash: GENESIS_PREV_HASH.to_string(),
            }),
            on_new: Mutex::new(Vec::new()),
        }
    }

    /// PoW hash of the most recently admitted message; outbound messages
    /// use it as `prev_hash`. Genesis value before any admission.
    pub fn last_hash(&self) -> String {
        self.inner.lock().unwrap().last_hash.clone()
    }

    /// Admit a message. True iff it was neither expired nor already
    /// present. On admission, `last_hash` advances and every `on_new`
    /// subscriber fires; a panicking subscriber does not abort the caller.
    pub fn add(&self, msg: &Message) -> bool {
        if msg.is_expired() {
            return false;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.messages.contains_key(&msg.id) {
                return false;
            }
            inner.messages.insert(msg.id.clone(), msg.clone());
            inner.last_hash = msg.pow_hash.clone();
        }
        let callbacks: Vec<Callback> = self.on_new.lock().unwrap().clone();
        for cb in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(msg)));
            if result.is_err() {
                tracing::warn!("message callback panicked");
            }
        }
        true
    }

    /// Register a subscriber fired on every successful `add`.
    pub fn on_new_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        self.on_new.lock().unwrap().push(Arc::new(callback));
    }

    /// All live messages, oldest first.
    pub fn get_all(&self) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.messages);
        sorted(inner.messages.values().cloned().collect())
    }

    pub fn get_by_board(&self, board: &str) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.messages);
        sorted(
            inner
                .messages
                .values()
                .filter(|m| m.board == board)
                .cloned()
                .collect(),
        )
    }

    pub fn get_by_thread(&self, thread_id: &str) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.messages);
        sorted(
            inner
                .messages
                .values()
                .filter(|m| m.thread_id == thread_id)
                .cloned()
                .collect(),
        )
    }

    /// Board-level messages only (no thread) — the open chat of a board.
    pub fn get_board_chat(&self, board: &str) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.messages);
        sorted(
            inner
                .messages
                .values()
                .filter(|m| m.board == board && m.thread_id.is_empty())
                .cloned()
                .collect(),
        )
    }

    /// Boards with live messages, sorted. Never empty: "general" stands in
    /// when the store is.
    pub fn get_boards(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut boards: Vec<String> = inner
            .messages
            .values()
            .filter(|m| !m.is_expired())
            .map(|m| m.board.clone())
            .collect();
        boards.sort();
        boards.dedup();
        if boards.is_empty() {
            boards.push("general".to_string());
        }
        boards
    }

    /// Active threads in a board, newest activity first. The title is the
    /// most recent non-empty `thread_title`; the preview is the first 60
    /// characters of the latest message.
    pub fn get_threads(&self, board: &str) -> Vec<ThreadSummary> {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.messages);

        struct Agg {
            summary: ThreadSummary,
            title_ts: f64,
        }
        let mut threads: HashMap<String, Agg> = HashMap::new();

        for msg in inner.messages.values() {
            if msg.board != board || msg.thread_id.is_empty() {
                continue;
            }
            let agg = threads.entry(msg.thread_id.clone()).or_insert_with(|| Agg {
                summary: ThreadSummary {
                    thread_id: msg.thread_id.clone(),
                    title: "untitled".to_string(),
                    count: 0,
                    latest: 0.0,
                    preview: String::new(),
                    preview_author: String::new(),
                },
                title_ts: f64::NEG_INFINITY,
            });
            agg.summary.count += 1;
            if !msg.thread_title.is_empty() && msg.timestamp >= agg.title_ts {
                agg.summary.title = msg.thread_title.clone();
                agg.title_ts = msg.timestamp;
            }
            if msg.timestamp > agg.summary.latest {
                agg.summary.latest = msg.timestamp;
                agg.summary.preview = msg.content.chars().take(60).collect();
                agg.summary.preview_author = msg.display_author();
            }
        }

        let mut list: Vec<ThreadSummary> = threads.into_values().map(|a| a.summary).collect();
        list.sort_by(|a, b| b.latest.total_cmp(&a.latest));
        list
    }

    /// Live messages mentioning `@name`.
    pub fn get_mentions(&self, name: &str) -> Vec<Message> {
        let needle = format!("@{name}");
        self.get_all()
            .into_iter()
            .filter(|m| m.content.contains(&needle))
            .collect()
    }

    /// Evict expired messages from both maps. Returns how many went.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.messages) + prune_map(&mut inner.direct)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.lock().unwrap().messages.contains_key(id)
    }

    // -------------------------------------------------------------------------
    // Direct messages: structurally identical map, kept apart from boards.
    // No `last_hash` movement, no board callbacks.
    // -------------------------------------------------------------------------

    pub fn add_direct(&self, msg: &Message) -> bool {
        if msg.is_expired() {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.direct.contains_key(&msg.id) {
            return false;
        }
        inner.direct.insert(msg.id.clone(), msg.clone());
        true
    }

    pub fn get_direct(&self) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        prune_map(&mut inner.direct);
        sorted(inner.direct.values().cloned().collect())
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_map(map: &mut HashMap<String, Message>) -> usize {
    let before = map.len();
    map.retain(|_, m| !m.is_expired());
    before - map.len()
}

fn sorted(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    messages
}
