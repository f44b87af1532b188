//! Core fixed-window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::key::RateLimitKey;
use super::limits::LimitConfig;
use super::store::{CounterStore, Hit, MemoryCounterStore};

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Allowed {
        /// Requests left in the current window
        remaining: u32,
    },
    /// The request is over the limit.
    Rejected {
        /// Whole seconds until the window resets, rounded up
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Per-client fixed-window admission control for one route family.
///
/// A limiter is cheap to share behind an `Arc`. Several limiters may share
/// one store; their prefixes keep the counters apart.
pub struct RateLimiter {
    config: LimitConfig,
    store: Arc<dyn CounterStore>,
    /// When set, every request is admitted without touching the store
    bypass: bool,
}

impl RateLimiter {
    /// Create a limiter over the given store.
    pub fn new(config: LimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            config,
            store,
            bypass: false,
        }
    }

    /// Create a limiter with its own in-memory store.
    pub fn create(window: Duration, max_requests: u32, key_prefix: &str) -> Self {
        Self::new(
            LimitConfig::new(key_prefix, window, max_requests),
            Arc::new(MemoryCounterStore::new()),
        )
    }

    /// Admit every request without counting. Meant for automated tests of
    /// the routes behind the limiter.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// The configuration this limiter enforces.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Check and record one request from `client`.
    pub async fn check(&self, client: &str) -> Admission {
        if self.bypass {
            return Admission::Allowed {
                remaining: self.config.max_requests,
            };
        }

        let key = RateLimitKey::new(&self.config.key_prefix, client);
        let max = self.config.max_requests;
        let now = Instant::now();

        let entry = match self
            .store
            .hit(&key.to_store_key(), now, self.config.window(), max)
            .await
        {
            Hit::Counted(entry) => {
                trace!(key = %key, count = entry.count, limit = max, "Request admitted");
                return Admission::Allowed {
                    remaining: max.saturating_sub(entry.count),
                };
            }
            Hit::Full(entry) => entry,
        };

        let retry_after_secs = retry_after_secs(entry.reset_at, now);
        debug!(
            key = %key,
            count = entry.count,
            limit = max,
            retry_after_secs,
            "Rate limit exceeded"
        );
        Admission::Rejected { retry_after_secs }
    }

    /// Current count for a client, if a live window exists.
    pub async fn current_count(&self, client: &str) -> Option<u32> {
        let key = RateLimitKey::new(&self.config.key_prefix, client).to_store_key();
        self.store
            .get(&key)
            .await
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.count)
    }

    /// Forget a client's counter, e.g. after a successful login.
    pub async fn reset(&self, client: &str) {
        let key = RateLimitKey::new(&self.config.key_prefix, client).to_store_key();
        self.store.delete(&key).await;
    }
}

/// `ceil((reset_at - now) / 1s)`.
fn retry_after_secs(reset_at: Instant, now: Instant) -> u64 {
    let remaining = reset_at.saturating_duration_since(now);
    remaining.as_millis().div_ceil(1000) as u64
}
