use {
    super::Cache,
    async_trait::async_trait,
    parking_lot::Mutex,
    std::{
        num::NonZeroUsize,
        time::{Duration, Instant},
    },
};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Bounded in-process cache with least-recently-used eviction.
pub struct LruCache {
    entries: Mutex<lru::LruCache<String, Entry>>,
    default_ttl: Option<Duration>,
}

impl LruCache {
    /// A zero `max_entries` is treated as one.
    #[must_use]
    #[inline]
    pub fn new(max_entries: usize, default_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(lru::LruCache::new(capacity)),
            default_ttl,
        }
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl Cache for LruCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return None,
            Some(entry) => entry
                .expires_at
                .is_some_and(|expires_at| expires_at <= Instant::now()),
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl
            .or(self.default_ttl)
            .and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .lock()
            .put(key.to_owned(), Entry { value, expires_at });
    }

    async fn flush(&self) {
        self.entries.lock().clear();
    }

    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::time::sleep};

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = LruCache::new(2, None);
        cache.set_raw("a", "1".into(), None).await;
        cache.set_raw("b", "2".into(), None).await;
        assert_eq!(cache.get_raw("a").await.as_deref(), Some("1"));
        cache.set_raw("c", "3".into(), None).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_raw("b").await, None);
        assert_eq!(cache.get_raw("a").await.as_deref(), Some("1"));
        assert_eq!(cache.get_raw("c").await.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn honors_ttl() {
        let cache = LruCache::new(10, Some(Duration::from_millis(50)));
        cache.set_raw("default", "1".into(), None).await;
        cache
            .set_raw("long", "2".into(), Some(Duration::from_secs(60)))
            .await;
        assert!(cache.get_raw("default").await.is_some());
        sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get_raw("default").await, None);
        assert_eq!(cache.get_raw("long").await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn flush_clears() {
        let cache = LruCache::new(10, None);
        cache.set_raw("a", "1".into(), None).await;
        cache.flush().await;
        assert!(cache.is_empty());
    }
}
