//! Per-key request counting for the decision engine.
//!
//! Two interchangeable algorithms sit behind the [`RateLimiter`] facade:
//!
//! - **Fixed window** (default) -- one counter per key that resets once the
//!   window has elapsed. Cheap and exact within a window; bursts that straddle
//!   a boundary can briefly exceed the limit.
//!
//! - **Sliding window counter** -- blends the previous window's count into the
//!   current one to smooth out boundary bursts.
//!
//! Both keep their counters in a [`DashMap`](dashmap::DashMap), so each key is
//! locked independently and unrelated keys never contend. Limit and window are
//! passed per call, letting one limiter serve every endpoint.

pub mod fixed_window;
pub mod sliding_window;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blockgate_common::RateLimitAlgorithm;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;

/// Point-in-time view of one key's counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateCounter {
    pub key: String,
    pub window_start: Instant,
    pub count: u64,
    pub limit: u64,
    pub window: Duration,
}

/// Build the composite counter key for a request.
///
/// The API key segment is `-` when the request carries none.
pub fn rate_key(ip: IpAddr, endpoint: &str, api_key: Option<&str>) -> String {
    format!("{}|{}|{}", ip, endpoint, api_key.unwrap_or("-"))
}

/// A unified rate limiter that delegates to one of the supported algorithms.
///
/// The limiter is cheaply cloneable (backed by `Arc`) and safe to share across
/// tasks and threads.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

enum RateLimiterInner {
    FixedWindow(FixedWindowLimiter),
    SlidingWindow(SlidingWindowLimiter),
}

impl RateLimiter {
    pub fn new(algorithm: RateLimitAlgorithm) -> Self {
        tracing::info!(?algorithm, "creating rate limiter");
        let inner = match algorithm {
            RateLimitAlgorithm::FixedWindow => {
                RateLimiterInner::FixedWindow(FixedWindowLimiter::new())
            }
            RateLimitAlgorithm::SlidingWindow => {
                RateLimiterInner::SlidingWindow(SlidingWindowLimiter::new())
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn new_fixed_window() -> Self {
        Self::new(RateLimitAlgorithm::FixedWindow)
    }

    pub fn new_sliding_window() -> Self {
        Self::new(RateLimitAlgorithm::SlidingWindow)
    }

    /// Count a request for `key` and return `false` once it exceeds `limit`
    /// within `window`.
    pub fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        self.allow_at(key, limit, window, Instant::now())
    }

    pub fn allow_at(&self, key: &str, limit: u64, window: Duration, now: Instant) -> bool {
        match self.inner.as_ref() {
            RateLimiterInner::FixedWindow(limiter) => limiter.check_at(key, limit, window, now),
            RateLimiterInner::SlidingWindow(limiter) => limiter.check_at(key, limit, window, now),
        }
    }

    pub fn counter(&self, key: &str) -> Option<RateCounter> {
        match self.inner.as_ref() {
            RateLimiterInner::FixedWindow(limiter) => limiter.counter(key),
            RateLimiterInner::SlidingWindow(limiter) => limiter.counter(key),
        }
    }

    /// Evict counters that can no longer influence a decision.
    pub fn cleanup(&self) {
        let now = Instant::now();
        match self.inner.as_ref() {
            RateLimiterInner::FixedWindow(limiter) => limiter.cleanup(now),
            RateLimiterInner::SlidingWindow(limiter) => limiter.cleanup(now),
        }
        tracing::trace!("rate limiter cleanup tick completed");
    }

    pub fn tracked_keys(&self) -> usize {
        match self.inner.as_ref() {
            RateLimiterInner::FixedWindow(limiter) => limiter.len(),
            RateLimiterInner::SlidingWindow(limiter) => limiter.len(),
        }
    }
}
