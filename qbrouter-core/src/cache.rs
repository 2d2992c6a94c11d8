use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Short-lived key/value cache with a fixed time-to-live and explicit invalidation.
///
/// Entries are never refreshed in the background: a stale entry is simply treated as absent on
/// the next lookup. Clones share the same storage.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    inner: Arc<Mutex<HashMap<K, Entry<V>>>>,
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.try_lock().map(|guard| guard.len()).ok();
        f.debug_struct("TtlCache")
            .field("ttl", &self.ttl)
            .field("entries", &entries)
            .finish()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().await;
        match guard.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.lock().await;
        guard.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.lock().await.remove(key);
    }

    pub async fn invalidate_all(&self) {
        self.inner.lock().await.clear();
    }

    /// Return the cached value or compute it with `fetch`, caching only successful results.
    ///
    /// The lock is not held while `fetch` runs, so two concurrent misses may both fetch; the
    /// later insert wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }

        let value = fetch().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(10));
        cache.insert("free_space", 42).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(&"free_space").await, Some(42));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"free_space").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_forces_refetch() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(7)
        };

        assert_eq!(cache.get_or_try_insert_with("k".into(), fetch).await, Ok(7));
        assert_eq!(cache.get_or_try_insert_with("k".into(), fetch).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate(&"k".to_string()).await;
        assert_eq!(cache.get_or_try_insert_with("k".into(), fetch).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(60));
        let first: Result<u8, &str> = cache.get_or_try_insert_with(1, || async { Err("down") }).await;
        assert_eq!(first, Err("down"));
        assert_eq!(cache.get(&1).await, None);

        cache.insert(2, 9).await;
        cache.invalidate_all().await;
        assert_eq!(cache.get(&2).await, None);
    }
}
