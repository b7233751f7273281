use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::RateCounter;

/// Internal state for a single sliding window counter entry.
struct SlidingWindowState {
    current_count: u64,
    previous_count: u64,
    window_start: Instant,
    window: Duration,
    limit: u64,
}

/// A concurrent sliding window counter rate limiter.
///
/// This algorithm approximates a true sliding window by interpolating between
/// the previous and current fixed windows. It smooths out the boundary bursts
/// a plain fixed window allows while still keeping two counters per key.
pub struct SlidingWindowLimiter {
    windows: DashMap<String, SlidingWindowState>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check whether a request identified by `key` is allowed.
    ///
    /// Rejected requests are not counted against the window.
    pub fn check_at(&self, key: &str, limit: u64, window: Duration, now: Instant) -> bool {
        if let Some(mut entry) = self.windows.get_mut(key) {
            return admit(entry.value_mut(), limit, now);
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| {
            SlidingWindowState {
                current_count: 0,
                previous_count: 0,
                window_start: now,
                window,
                limit,
            }
        });
        admit(entry.value_mut(), limit, now)
    }

    pub fn counter(&self, key: &str) -> Option<RateCounter> {
        self.windows.get(key).map(|state| RateCounter {
            key: key.to_string(),
            window_start: state.window_start,
            count: state.current_count,
            limit: state.limit,
            window: state.window,
        })
    }

    /// Remove entries whose window started more than two windows ago.
    ///
    /// This should be called periodically to prevent unbounded memory growth
    /// from one-off client keys.
    pub fn cleanup(&self, now: Instant) {
        self.windows.retain(|_key, state| {
            now.saturating_duration_since(state.window_start) < state.window * 2
        });

        tracing::debug!(
            remaining = self.windows.len(),
            "sliding window cleanup complete"
        );
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn admit(state: &mut SlidingWindowState, limit: u64, now: Instant) -> bool {
    state.limit = limit;

    // Rotate windows if the current window has elapsed. An idle gap of two or
    // more windows leaves nothing to carry over.
    let elapsed = now.saturating_duration_since(state.window_start);
    if elapsed >= state.window && !state.window.is_zero() {
        let windows_passed = (elapsed.as_nanos() / state.window.as_nanos()) as u32;
        state.previous_count = if windows_passed == 1 {
            state.current_count
        } else {
            0
        };
        state.current_count = 0;
        state.window_start += state.window * windows_passed;
    }

    let elapsed_in_window = now.saturating_duration_since(state.window_start).as_secs_f64();
    let window_secs = state.window.as_secs_f64().max(f64::EPSILON);

    // Fraction of the current window that has elapsed (0.0 .. 1.0).
    let elapsed_fraction = (elapsed_in_window / window_secs).min(1.0);

    // Weighted count: blend previous window's contribution with the current
    // window's count.
    let weighted_count =
        (state.previous_count as f64) * (1.0 - elapsed_fraction) + (state.current_count as f64);

    if weighted_count < state.limit as f64 {
        state.current_count += 1;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn allows_up_to_limit() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();

        for i in 0..10 {
            assert!(limiter.check_at("k", 10, SECOND, now), "request {} should be allowed", i);
        }

        assert!(!limiter.check_at("k", 10, SECOND, now), "should deny beyond limit");
    }

    #[test]
    fn previous_window_still_weighs_in() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();

        for _ in 0..10 {
            limiter.check_at("k", 10, SECOND, start);
        }

        // A tenth of the way into the next window, 90% of the previous
        // window's count still applies: 9 weighted requests, so one more fits.
        let early = start + Duration::from_millis(1100);
        assert!(limiter.check_at("k", 10, SECOND, early));
        assert!(!limiter.check_at("k", 10, SECOND, early));
    }

    #[test]
    fn window_rotation_resets_count() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();

        for _ in 0..5 {
            limiter.check_at("k", 5, SECOND, start);
        }
        assert!(!limiter.check_at("k", 5, SECOND, start));

        // Near the end of the next window the previous count has decayed.
        assert!(limiter.check_at("k", 5, SECOND, start + Duration::from_millis(1990)));
    }

    #[test]
    fn long_idle_gap_forgets_history() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();

        for _ in 0..5 {
            limiter.check_at("k", 5, SECOND, start);
        }

        let much_later = start + Duration::from_secs(3600);
        for _ in 0..5 {
            assert!(limiter.check_at("k", 5, SECOND, much_later));
        }
        assert_eq!(limiter.counter("k").unwrap().count, 5);
    }

    #[test]
    fn independent_keys() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();

        assert!(limiter.check_at("a", 2, SECOND, now));
        assert!(limiter.check_at("a", 2, SECOND, now));
        assert!(!limiter.check_at("a", 2, SECOND, now));

        // Key B is independent.
        assert!(limiter.check_at("b", 2, SECOND, now));
    }

    #[test]
    fn cleanup_removes_stale_entries() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        limiter.check_at("will-be-stale", 10, SECOND, start);
        limiter.check_at("keep-alive", 10, SECOND, start + Duration::from_secs(9));

        limiter.cleanup(start + Duration::from_secs(10));

        assert!(limiter.counter("keep-alive").is_some());
        assert!(limiter.counter("will-be-stale").is_none());
    }
}
