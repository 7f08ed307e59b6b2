//! Process-local fixed-window rate limiting.
//!
//! Counters live in memory only; each process enforces its own limit.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-key counter for the current window.
#[derive(Debug, Clone, Copy)]
struct RateCounter {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Fixed-window limiter keyed by caller identity (usually a client address).
#[derive(Clone)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    counters: Arc<Mutex<HashMap<String, RateCounter>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            window,
            clock,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `limit` requests per minute.
    pub fn per_minute(limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self::new(limit, Duration::minutes(1), clock)
    }

    /// Count one request for `key`. Up to `limit + burst` requests are
    /// allowed per window.
    pub fn allow(&self, key: &str, burst: u32) -> bool {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(counter) = counters.get_mut(key) {
            if now - counter.window_start < self.window {
                if counter.count >= self.limit.saturating_add(burst) {
                    return false;
                }
                counter.count += 1;
                return true;
            }
        }

        // First request for this key, or its window elapsed
        counters.insert(
            key.to_string(),
            RateCounter {
                window_start: now,
                count: 1,
            },
        );
        true
    }

    /// Drop counters whose window has elapsed; returns how many were removed.
    pub fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let before = counters.len();
        counters.retain(|_, c| now - c.window_start < self.window);
        before - counters.len()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}
