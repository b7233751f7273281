use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::RateCounter;

struct FixedWindowState {
    window_start: Instant,
    count: u64,
    limit: u64,
    window: Duration,
}

/// A concurrent fixed-window counter rate limiter.
///
/// Every key counts requests from the first request of its window; once the
/// window has fully elapsed the next request opens a new window starting at
/// its own arrival time. Bursts straddling a window boundary can reach up to
/// twice the limit; that imprecision is accepted in exchange for one counter
/// per key.
pub struct FixedWindowLimiter {
    counters: DashMap<String, FixedWindowState>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Count a request for `key` and report whether it is within `limit`.
    ///
    /// Requests past the limit are still counted, so a key that keeps
    /// hammering stays rejected for the rest of the window.
    pub fn check_at(&self, key: &str, limit: u64, window: Duration, now: Instant) -> bool {
        // Fast path: existing key, no allocation for the map key.
        if let Some(mut entry) = self.counters.get_mut(key) {
            return record(entry.value_mut(), limit, window, now);
        }

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| FixedWindowState {
                window_start: now,
                count: 0,
                limit,
                window,
            });
        record(entry.value_mut(), limit, window, now)
    }

    pub fn counter(&self, key: &str) -> Option<RateCounter> {
        self.counters.get(key).map(|state| RateCounter {
            key: key.to_string(),
            window_start: state.window_start,
            count: state.count,
            limit: state.limit,
            window: state.window,
        })
    }

    /// Remove counters whose window ended more than one window ago.
    pub fn cleanup(&self, now: Instant) {
        self.counters.retain(|_key, state| {
            now.saturating_duration_since(state.window_start) < state.window * 2
        });

        tracing::debug!(
            remaining = self.counters.len(),
            "fixed window cleanup complete"
        );
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn record(state: &mut FixedWindowState, limit: u64, window: Duration, now: Instant) -> bool {
    state.limit = limit;
    state.window = window;

    if now.saturating_duration_since(state.window_start) >= window {
        state.window_start = now;
        state.count = 0;
    }

    state.count += 1;
    state.count <= limit
}
