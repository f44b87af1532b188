//! Counter storage for fixed-window rate limiting.
//!
//! The limiter only talks to a [`CounterStore`], so the in-process map can
//! be swapped for a shared backend without touching the middleware.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Request count for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Requests admitted in the current window
    pub count: u32,
    /// When the current window ends
    pub reset_at: Instant,
}

impl RateLimitEntry {
    /// Open a new window at `now` with one admitted request.
    pub fn first(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            reset_at: now + window,
        }
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.reset_at
    }
}

/// Result of counting one request with [`CounterStore::hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    /// The request was counted; holds the entry after the increment
    Counted(RateLimitEntry),
    /// The window was already full; holds the unchanged entry
    Full(RateLimitEntry),
}

/// Key-value storage for rate limit entries.
///
/// Each horizontally scaled process holding its own store enforces its
/// own independent limit.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Get the entry for a key.
    async fn get(&self, key: &str) -> Option<RateLimitEntry>;

    /// Insert or replace the entry for a key.
    async fn set(&self, key: &str, entry: RateLimitEntry);

    /// Remove the entry for a key.
    async fn delete(&self, key: &str);

    /// Count one request against `key` in a single atomic step.
    ///
    /// Opens a fresh window when the key has none or its window ended
    /// before `now`. Otherwise the count is incremented unless it has
    /// already reached `limit`. Hits on different keys must not wait on
    /// each other.
    async fn hit(&self, key: &str, now: Instant, window: Duration, limit: u32) -> Hit;

    /// Remove every entry whose window ended before `now`.
    ///
    /// Returns the number of entries removed.
    async fn remove_expired(&self, now: Instant) -> usize;

    /// Number of entries currently held.
    async fn len(&self) -> usize;
}

/// Process-local counter store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| *e)
    }

    async fn set(&self, key: &str, entry: RateLimitEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn hit(&self, key: &str, now: Instant, window: Duration, limit: u32) -> Hit {
        // The entry guard holds the shard lock until the update is done.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = RateLimitEntry::first(now, window);
                    Hit::Counted(*entry)
                } else if entry.count < limit {
                    entry.count += 1;
                    Hit::Counted(*entry)
                } else {
                    Hit::Full(*entry)
                }
            }
            Entry::Vacant(vacant) => {
                let entry = RateLimitEntry::first(now, window);
                vacant.insert(entry);
                Hit::Counted(entry)
            }
        }
    }

    async fn remove_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Spawn a task that periodically drops expired entries from `store`.
///
/// The sweep interval is independent of any limiter's window. Abort the
/// returned handle to stop sweeping.
pub fn spawn_sweeper(store: Arc<dyn CounterStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = store.remove_expired(Instant::now()).await;
            if removed > 0 {
                debug!(removed, "Swept expired rate limit entries");
            } else {
                trace!("Rate limit sweep found nothing to remove");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryCounterStore::new();
        let entry = RateLimitEntry::first(Instant::now(), Duration::from_secs(1));

        assert_eq!(store.get("login:a").await, None);
        store.set("login:a", entry).await;
        assert_eq!(store.get("login:a").await, Some(entry));
        assert_eq!(store.len().await, 1);

        store.delete("login:a").await;
        assert_eq!(store.get("login:a").await, None);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_counts_up_to_limit_then_reopens() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(10);
        let start = Instant::now();

        for expected in 1..=2 {
            match store.hit("login:a", Instant::now(), window, 2).await {
                Hit::Counted(entry) => {
                    assert_eq!(entry.count, expected);
                    assert_eq!(entry.reset_at, start + window);
                }
                Hit::Full(entry) => panic!("unexpected full window: {:?}", entry),
            }
        }
        assert!(matches!(
            store.hit("login:a", Instant::now(), window, 2).await,
            Hit::Full(RateLimitEntry { count: 2, .. })
        ));

        tokio::time::advance(Duration::from_millis(10_001)).await;
        let now = Instant::now();
        assert_eq!(
            store.hit("login:a", now, window, 2).await,
            Hit::Counted(RateLimitEntry::first(now, window))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired_keeps_live_entries() {
        let store = MemoryCounterStore::new();
        let now = Instant::now();

        store
            .set("login:old", RateLimitEntry::first(now, Duration::from_secs(1)))
            .await;
        store
            .set("login:new", RateLimitEntry::first(now, Duration::from_secs(60)))
            .await;

        tokio::time::advance(Duration::from_secs(2)).await;

        let removed = store.remove_expired(Instant::now()).await;
        assert_eq!(removed, 1);
        assert!(store.get("login:old").await.is_none());
        assert!(store.get("login:new").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let store = Arc::new(MemoryCounterStore::new());
        store
            .set(
                "signup:a",
                RateLimitEntry::first(Instant::now(), Duration::from_millis(500)),
            )
            .await;

        let sweeper = spawn_sweeper(store.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.len().await, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.len().await, 0);

        sweeper.abort();
    }

    #[test]
    fn test_entry_expiry_is_strict() {
        let now = Instant::now();
        let entry = RateLimitEntry::first(now, Duration::from_secs(1));

        assert!(!entry.is_expired(now + Duration::from_secs(1)));
        assert!(entry.is_expired(now + Duration::from_millis(1001)));
    }
}
