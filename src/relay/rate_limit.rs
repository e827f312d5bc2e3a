//! Sliding-window rate limiting for relay sessions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts events inside a trailing window; events beyond the limit are
/// refused until old ones age out.
#[derive(Debug)]
pub struct SlidingWindow {
    hits: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(limit: usize, window_secs: f64) -> Self {
        Self {
            hits: VecDeque::with_capacity(limit),
            limit,
            window: Duration::from_secs_f64(window_secs),
        }
    }

    /// Record one event if the window has room. False means: drop it.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let mut limiter = SlidingWindow::new(3, 1.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn window_slides() {
        let mut limiter = SlidingWindow::new(2, 0.05);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.allow());
    }

    #[test]
    fn memory_stays_bounded() {
        let mut limiter = SlidingWindow::new(5, 60.0);
        for _ in 0..100 {
            limiter.allow();
        }
        assert!(limiter.hits.len() <= 5);
    }
}
