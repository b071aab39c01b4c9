//! Per-session rate limiting.
//!
//! A fixed-window counter keyed by session id. The clock is injected so
//! tests can drive the window deterministically instead of sleeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of monotonic time for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Outcome of a rate check. `Limited` carries how long the caller should
/// wait before the window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

struct WindowState {
    window_start: Instant,
    count: u32,
}

/// Fixed-window counter: at most `capacity` checks per key per `window`.
///
/// State is behind a `std::sync::Mutex` — critical sections are a map
/// lookup and an increment, never an await.
pub struct FixedWindowLimiter {
    window: Duration,
    capacity: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<String, WindowState>>,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, capacity: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            capacity,
            clock,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request against `key` and decide whether it may proceed.
    ///
    /// The increment and the decision happen under one lock acquisition,
    /// so concurrent checks for the same key never double-spend a slot.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let entry = state.entry(key.to_string()).or_insert(WindowState {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= self.capacity {
            let elapsed = now.duration_since(entry.window_start);
            let retry_after = self.window.saturating_sub(elapsed).max(Duration::from_secs(1));
            return RateDecision::Limited { retry_after };
        }

        entry.count += 1;
        RateDecision::Allowed
    }

    /// Drop per-key state whose window has fully expired. Quiet sessions
    /// would otherwise keep a map entry forever; the next `check` for an
    /// evicted key simply starts a fresh window.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
