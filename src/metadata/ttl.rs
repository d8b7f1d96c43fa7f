//! Expiring map with single-flight loading.

use crate::metadata::MetadataError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

type Flight<T> = Arc<OnceCell<Result<T, MetadataError>>>;

/// A cached value and the instant it stops being served.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    #[must_use]
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// String-keyed cache whose entries expire after a fixed TTL.
///
/// Concurrent misses on one key share a single loader call. Loader errors
/// reach every waiter of that flight but are not stored.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    flights: DashMap<String, Flight<T>>,
}

impl<T: Clone + Send + Sync> TtlCache<T> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            flights: DashMap::new(),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Stores `value` with a fresh expiration.
    pub fn insert(&self, key: impl Into<String>, value: T) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Returns the live value for `key`, running `loader` on a miss.
    ///
    /// Callers that miss while a load for the same key is in flight wait for
    /// it instead of starting their own.
    pub async fn fetch<F, Fut>(&self, key: &str, loader: F) -> Result<T, MetadataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MetadataError>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let flight = self
            .flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = flight
            .get_or_init(|| async {
                // a flight that finished between our miss and now already stored it
                if let Some(value) = self.get(key) {
                    return Ok(value);
                }
                let loaded = loader().await;
                if let Ok(value) = &loaded {
                    self.insert(key, value.clone());
                }
                loaded
            })
            .await
            .clone();

        self.flights
            .remove_if(key, |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Stored entries, expired ones included until the next sweep.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_load_once() {
        let cache = Arc::new(TtlCache::<u64>::new(Duration::from_secs(5)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .fetch("owner", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.flights.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_reloaded() {
        let cache = TtlCache::<u64>::new(Duration::from_millis(30));
        assert_eq!(cache.fetch("k", || async { Ok(1) }).await.unwrap(), 1);
        assert_eq!(cache.fetch("k", || async { Ok(2) }).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.fetch("k", || async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_loader_errors_are_not_cached() {
        let cache = TtlCache::<u64>::new(Duration::from_secs(5));
        let failed = cache
            .fetch("k", || async { Err(MetadataError::NotFound("k".to_string())) })
            .await;
        assert!(matches!(failed, Err(MetadataError::NotFound(_))));
        assert!(cache.is_empty());

        assert_eq!(cache.fetch("k", || async { Ok(9) }).await.unwrap(), 9);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = TtlCache::<u64>::new(Duration::from_millis(20));
        cache.insert("old", 1);
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("new", 2);

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("new"), Some(2));
    }
}
