use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::{CarrierId, TrackInfo};

type CacheKey = (CarrierId, String);

/// Coalescing layer for polling pressure: many registrations watching
/// the same shipment share one carrier call per TTL window.
///
/// This is deliberately coarse. It is not a source of truth and is
/// never consulted on the delivery path.
pub struct TrackingCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_size: usize,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    expired: u64,
    evictions: u64,
}

struct CacheEntry {
    info: TrackInfo,
    inserted_at: Instant,
}

/// Snapshot of cache occupancy and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub ttl: Duration,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
}

impl TrackingCache {
    /// Create a cache with the given TTL and entry bound.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                expired: 0,
                evictions: 0,
            }),
            ttl,
            max_size: max_size.max(1),
        }
    }

    /// Defaults: 5 minute TTL, 1000 entries.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(300), 1000)
    }

    /// Return the cached timeline if present and fresh.
    ///
    /// A stale entry is deleted and reported as a miss.
    pub async fn get(&self, carrier_id: &CarrierId, tracking_number: &str) -> Option<TrackInfo> {
        let key = (carrier_id.clone(), tracking_number.to_string());
        let mut guard = self.inner.lock().await;

        let fresh = guard
            .entries
            .get(&key)
            .map(|entry| entry.inserted_at.elapsed() <= self.ttl);

        match fresh {
            Some(true) => {
                guard.hits += 1;
                guard.entries.get(&key).map(|entry| entry.info.clone())
            }
            Some(false) => {
                guard.entries.remove(&key);
                guard.expired += 1;
                guard.misses += 1;
                None
            }
            None => {
                guard.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an entry, evicting the oldest if the cache
    /// would exceed its bound.
    pub async fn set(&self, carrier_id: &CarrierId, tracking_number: &str, info: TrackInfo) {
        let key = (carrier_id.clone(), tracking_number.to_string());
        let mut guard = self.inner.lock().await;

        if !guard.entries.contains_key(&key) && guard.entries.len() >= self.max_size {
            let oldest = guard
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                guard.entries.remove(&oldest);
                guard.evictions += 1;
            }
        }

        guard.entries.insert(
            key,
            CacheEntry {
                info,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop one entry regardless of age.
    pub async fn invalidate(&self, carrier_id: &CarrierId, tracking_number: &str) {
        let key = (carrier_id.clone(), tracking_number.to_string());
        let mut guard = self.inner.lock().await;
        guard.entries.remove(&key);
    }

    /// Drop everything.
    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.entries.clear();
    }

    /// Evict every stale entry; returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let before = guard.entries.len();
        let ttl = self.ttl;
        guard.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        let dropped = before - guard.entries.len();
        guard.expired += dropped as u64;
        dropped
    }

    pub async fn stats(&self) -> CacheStats {
        let guard = self.inner.lock().await;
        CacheStats {
            entries: guard.entries.len(),
            max_size: self.max_size,
            ttl: self.ttl,
            hits: guard.hits,
            misses: guard.misses,
            expired: guard.expired,
            evictions: guard.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TrackEvent, TrackEventStatusCode};

    fn carrier() -> CarrierId {
        CarrierId("kr.cjlogistics".to_string())
    }

    fn info(n: usize) -> TrackInfo {
        TrackInfo::new(vec![TrackEvent::new(TrackEventStatusCode::InTransit); n])
    }

    #[tokio::test(start_paused = true)]
    async fn get_within_ttl_returns_value() {
        let cache = TrackingCache::new(Duration::from_secs(60), 10);
        cache.set(&carrier(), "100000001", info(3)).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&carrier(), "100000001").await, Some(info(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_a_miss_and_removed() {
        let cache = TrackingCache::new(Duration::from_secs(60), 10);
        cache.set(&carrier(), "100000001", info(3)).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&carrier(), "100000001").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_evicts_single_oldest_insertion() {
        let cache = TrackingCache::new(Duration::from_secs(60), 3);
        for i in 0..4 {
            cache.set(&carrier(), &format!("t{i}"), info(i)).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);
        assert_eq!(cache.get(&carrier(), "t0").await, None);
        assert!(cache.get(&carrier(), "t1").await.is_some());
        assert!(cache.get(&carrier(), "t3").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn replace_does_not_evict() {
        let cache = TrackingCache::new(Duration::from_secs(60), 2);
        cache.set(&carrier(), "a", info(1)).await;
        cache.set(&carrier(), "b", info(2)).await;
        cache.set(&carrier(), "a", info(3)).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 0);
        assert_eq!(cache.get(&carrier(), "a").await, Some(info(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_only_stale() {
        let cache = TrackingCache::new(Duration::from_secs(60), 10);
        cache.set(&carrier(), "old", info(1)).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.set(&carrier(), "new", info(2)).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.cleanup().await, 1);
        assert!(cache.get(&carrier(), "new").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let cache = TrackingCache::with_defaults();
        cache.set(&carrier(), "a", info(1)).await;
        cache.set(&carrier(), "b", info(2)).await;

        cache.invalidate(&carrier(), "a").await;
        assert_eq!(cache.get(&carrier(), "a").await, None);

        cache.clear().await;
        assert_eq!(cache.stats().await.entries, 0);
    }
}
