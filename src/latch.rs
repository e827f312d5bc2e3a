//! Latched one-shot event.
//!
//! Multiple tasks wait; one task sets; once set, every future wait returns
//! immediately. There is deliberately no way to re-arm a latch — the room
//! key exchange must not observe a set-then-cleared event within a session.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the latch. Idempotent.
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch fires. Returns immediately if already set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value first, so a set() that happened
        // before subscribe() is not missed.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_after_set_returns_immediately() {
        let latch = Latch::new();
        latch.set();
        latch.wait().await;
        assert!(latch.is_set());
    }

    #[tokio::test]
    async fn multiple_waiters_released() {
        let latch = Arc::new(Latch::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = latch.clone();
            handles.push(tokio::spawn(async move { l.wait().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.set();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn timeout_elapses_when_unset() {
        let latch = Latch::new();
        let res = tokio::time::timeout(Duration::from_millis(20), latch.wait()).await;
        assert!(res.is_err());
    }
}
