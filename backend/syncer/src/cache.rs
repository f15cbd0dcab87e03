//! Process-scoped expiring map.
//!
//! Owned by whoever constructs it (the HTTP state holds the stats cache); a
//! sweeper task evicts expired entries until its cancellation token fires.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, (Instant, V)>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Live value for `key`, if any.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(key, (Instant::now(), value));
    }

    /// Cached value, or the result of `load` stored for the next caller.
    /// Failed loads are not cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }
        let value = load().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Evict on `every` until `cancel` fires, then empty the map.
    pub fn spawn_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.cleanup_expired().await;
                        if evicted > 0 {
                            let remaining = cache.len().await;
                            debug!(evicted, remaining, "Cache sweep");
                        }
                    }
                }
            }
            cache.clear().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_millis(40));
        cache.insert("a", 1u64).await;
        assert_eq!(cache.get(&"a").await, Some(1));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&"a").await, None);
        assert_eq!(cache.cleanup_expired().await, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn loader_runs_once_per_ttl_and_errors_are_not_cached() {
        let cache: TtlCache<&str, u64> = TtlCache::new(Duration::from_secs(60));

        let failed: Result<u64, &str> = cache.get_or_try_insert_with("k", || async { Err("down") }).await;
        assert!(failed.is_err());
        assert_eq!(cache.len().await, 0);

        let first: Result<u64, &str> = cache.get_or_try_insert_with("k", || async { Ok(7) }).await;
        let second: Result<u64, &str> = cache.get_or_try_insert_with("k", || async { Ok(8) }).await;
        assert_eq!(first, Ok(7));
        assert_eq!(second, Ok(7));

        cache.invalidate(&"k").await;
        assert_eq!(cache.get(&"k").await, None);
    }

    #[tokio::test]
    async fn sweeper_evicts_and_clears_on_cancel() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert(1u8, "x").await;
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(5), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len().await, 0);

        cache.insert(2u8, "y").await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(cache.len().await, 0);
    }
}
