//! In-process TTL cache.
//!
//! A small keyed cache with per-entry expiry, used by the usage limiter
//! (decision cache, invalidated on every recorded query) and the
//! reconciliation manager (pull cooldown and freshness window). Explicit
//! invalidation is part of the contract: callers that mutate the
//! underlying state must invalidate the matching key.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    expires_at: Instant,
}

/// Bounded TTL cache keyed by `String`.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    max_entries: usize,
    ops: std::sync::atomic::AtomicU64,
}

const DEFAULT_MAX_ENTRIES: usize = 10_000;
const CLEANUP_INTERVAL: u64 = 100;

impl<V: Clone> TtlCache<V> {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_capacity(default_ttl, DEFAULT_MAX_ENTRIES)
    }

    #[must_use]
    pub fn with_capacity(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries,
            ops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Get a live value. Expired entries read as absent.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Get a live value together with its age.
    pub async fn get_with_age(&self, key: &str) -> Option<(V, Duration)> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some((entry.value.clone(), entry.stored_at.elapsed()))
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        // Periodic cleanup so expired entries don't accumulate
        let ops = self
            .ops
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if ops % CLEANUP_INTERVAL == 0 {
            entries.retain(|_, e| e.expires_at > now);
        }

        // At capacity, evict the entry closest to expiry
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
