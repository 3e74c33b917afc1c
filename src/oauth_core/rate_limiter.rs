//! Rate limiting abstraction for the token endpoint.

use std::sync::Arc;
use std::time::Instant;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use super::config::RateLimitConfig;
use super::error::OAuthError;

/// Trait for rate limiting by a given key (e.g., client ID or IP address).
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Attempts to consume one token for the specified key.
    /// Returns Ok(true) if allowed, Ok(false) if rate-limited, or Err on internal error.
    async fn consume(&self, key: &str) -> Result<bool, OAuthError>;

    /// Drops state for keys that no longer need it. Returns how many were dropped.
    async fn sweep(&self) -> Result<usize, OAuthError> {
        Ok(0)
    }
}

// Simple token bucket
#[derive(Debug)]
struct TokenBucket {
    capacity: u32,
    tokens: f64,
    last: Instant,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self { capacity, tokens: capacity as f64, last: Instant::now(), refill_rate }
    }

    fn consume(&mut self, amount: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last = now;
        if self.tokens >= amount as f64 {
            self.tokens -= amount as f64;
            true
        } else {
            false
        }
    }

    /// A refilled bucket is indistinguishable from a fresh one.
    fn is_refilled(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens + elapsed * self.refill_rate >= self.capacity as f64
    }
}

/// Per-key token buckets held in memory.
///
/// Keys are claimed client ids, so the map is capped at `max_keys`; once
/// full, unseen keys are refused until [`RateLimiter::sweep`] evicts
/// buckets that have refilled.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    capacity: u32,
    refill_rate: f64,
    max_keys: usize,
}

impl InMemoryRateLimiter {
    /// `capacity` requests in a burst, refilled at `refill_per_minute`.
    pub fn new(capacity: u32, refill_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity,
            refill_rate: refill_per_minute as f64 / 60.0,
            max_keys: RateLimitConfig::default().max_tracked_keys,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_minute).max_tracked_keys(config.max_tracked_keys)
    }

    pub fn max_tracked_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    fn evict_refilled(&self) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets.retain(|_, bucket| !bucket.is_refilled(now));
        before.saturating_sub(self.buckets.len())
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn consume(&self, key: &str) -> Result<bool, OAuthError> {
        // Zero capacity disables limiting.
        if self.capacity == 0 {
            return Ok(true);
        }
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return Ok(bucket.consume(1));
        }
        if self.buckets.len() >= self.max_keys {
            self.evict_refilled();
            if self.buckets.len() >= self.max_keys {
                debug!(tracked = self.buckets.len(), "rate limiter full, refusing unseen client id");
                return Ok(false);
            }
        }
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate));
        Ok(bucket.consume(1))
    }

    async fn sweep(&self) -> Result<usize, OAuthError> {
        Ok(self.evict_refilled())
    }
}
