//! Caches used by connections to avoid redundant backend round trips.
//!
//! Cache operations never fail. Any error of the underlying store is logged
//! and treated as a miss.

mod distributed;
mod memory;

#[cfg(test)]
pub(crate) use self::distributed::test_redis_server;
pub use self::{
    distributed::{CacheStats, RedisCache},
    memory::LruCache,
};

use {
    async_trait::async_trait,
    cloakfs_protocol::{NotFound, settings::CacheSettings},
    parking_lot::Mutex,
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    std::{
        collections::HashMap,
        sync::{Arc, LazyLock},
        time::Duration,
    },
    tracing::{debug, warn},
};

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<String>;
    /// Stores `value`. Without `ttl`, the cache's default expiration applies.
    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>);
    async fn flush(&self);
    async fn disconnect(&self);
}

impl dyn Cache {
    #[inline]
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(?err, key, "dropping undecodable cache entry");
                None
            }
        }
    }

    #[inline]
    pub async fn set_value<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_raw(key, raw, ttl).await,
            Err(err) => warn!(?err, key, "failed to encode cache entry"),
        }
    }
}

/// A cached result. `NotFound` records that the backend reported a missing path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cached<T> {
    Value(T),
    NotFound(NotFound),
}

impl<T> Cached<T> {
    /// Converts back into the result the entry was created from.
    #[inline]
    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            Self::Value(value) => Ok(value),
            Self::NotFound(err) => Err(err.into()),
        }
    }
}

/// Used when caching is turned off.
#[derive(Debug, Default)]
pub struct DisabledCache;

#[async_trait]
impl Cache for DisabledCache {
    async fn get_raw(&self, _key: &str) -> Option<String> {
        None
    }

    async fn set_raw(&self, _key: &str, _value: String, _ttl: Option<Duration>) {}

    async fn flush(&self) {}

    async fn disconnect(&self) {}
}

enum Store {
    Disabled,
    Local { lru_size: usize, ttl: Option<Duration> },
    Redis(Arc<RedisCache>),
}

/// Cache of a connection identity, split into named scopes.
///
/// Scopes are created lazily and memoized, so every caller asking for the same
/// scope name gets the same instance.
pub struct SharedCache {
    store: Store,
    scopes: Mutex<HashMap<String, Arc<dyn Cache>>>,
}

impl SharedCache {
    /// Builds the cache described by `settings`. Never fails: an unreachable
    /// Redis server results in in-process caches.
    #[inline]
    pub async fn new(id: &str, settings: &CacheSettings) -> Self {
        let store = if !settings.enabled {
            Store::Disabled
        } else if let Some(host) = &settings.host {
            Store::Redis(Arc::new(RedisCache::connect(id, host, settings).await))
        } else {
            Store::Local {
                lru_size: settings.lru_size,
                ttl: settings.ttl,
            }
        };
        Self {
            store,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    #[inline]
    pub fn scoped(&self, name: &str) -> Arc<dyn Cache> {
        let mut scopes = self.scopes.lock();
        if let Some(scope) = scopes.get(name) {
            return Arc::clone(scope);
        }
        let scope: Arc<dyn Cache> = match &self.store {
            Store::Disabled => Arc::new(DisabledCache),
            Store::Local { lru_size, ttl } => Arc::new(LruCache::new(*lru_size, *ttl)),
            Store::Redis(redis) => redis.scoped(name),
        };
        scopes.insert(name.to_owned(), Arc::clone(&scope));
        scope
    }

    fn all_scopes(&self) -> Vec<Arc<dyn Cache>> {
        self.scopes.lock().values().cloned().collect()
    }

    /// Clears every scope of this cache.
    #[inline]
    pub async fn flush(&self) {
        for scope in self.all_scopes() {
            scope.flush().await;
        }
        if let Store::Redis(redis) = &self.store {
            redis.flush().await;
        }
    }

    #[inline]
    pub async fn disconnect(&self) {
        for scope in self.all_scopes() {
            scope.disconnect().await;
        }
        if let Store::Redis(redis) = &self.store {
            redis.disconnect().await;
        }
    }

    /// Hit/miss counters. Only available for Redis caches.
    #[must_use]
    #[inline]
    pub fn stats(&self) -> Option<CacheStats> {
        match &self.store {
            Store::Redis(redis) => Some(redis.stats()),
            Store::Disabled | Store::Local { .. } => None,
        }
    }

    /// Client of the Redis server, if this cache is backed by a reachable one.
    #[must_use]
    #[inline]
    pub fn redis_client(&self) -> Option<redis::Client> {
        match &self.store {
            Store::Redis(redis) => redis.client(),
            Store::Disabled | Store::Local { .. } => None,
        }
    }
}

static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<SharedCache>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns the cache registered for `id`, creating it if necessary.
#[inline]
pub async fn shared_cache(id: &str, settings: &CacheSettings) -> Arc<SharedCache> {
    if let Some(cache) = REGISTRY.lock().get(id) {
        return Arc::clone(cache);
    }
    let cache = Arc::new(SharedCache::new(id, settings).await);
    let mut registry = REGISTRY.lock();
    Arc::clone(registry.entry(id.to_owned()).or_insert(cache))
}

/// Unregisters the cache of `id` if `cache` is its last user besides the registry,
/// and disconnects it.
#[inline]
pub async fn release(id: &str, cache: Arc<SharedCache>) {
    let last = {
        let mut registry = REGISTRY.lock();
        let last = registry
            .get(id)
            .is_some_and(|registered| Arc::ptr_eq(registered, &cache))
            && Arc::strong_count(&cache) <= 2;
        if last {
            registry.remove(id);
        }
        last
    };
    if last {
        debug!(id, "disconnecting cache");
        cache.disconnect().await;
    }
}

/// Disconnects and unregisters every shared cache.
#[inline]
pub async fn close_all() {
    let caches: Vec<_> = REGISTRY.lock().drain().map(|(_, cache)| cache).collect();
    for cache in caches {
        cache.disconnect().await;
    }
}

#[inline]
pub async fn flush_all() {
    let caches: Vec<_> = REGISTRY.lock().values().cloned().collect();
    for cache in caches {
        cache.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_is_empty() {
        let cache = SharedCache::new("test_disabled", &CacheSettings::disabled()).await;
        let scope = cache.scoped("a");
        scope.set_value("k", &1_u32, None).await;
        assert_eq!(scope.get_value::<u32>("k").await, None);
        assert!(cache.stats().is_none());
    }

    #[tokio::test]
    async fn scopes_are_memoized_and_isolated() {
        let cache = SharedCache::new("test_local", &CacheSettings::default()).await;
        let a = cache.scoped("a");
        let b = cache.scoped("b");
        assert!(Arc::ptr_eq(&a, &cache.scoped("a")));
        a.set_value("k", &"in a", None).await;
        b.set_value("k", &"in b", None).await;
        assert_eq!(a.get_value::<String>("k").await.unwrap(), "in a");
        b.flush().await;
        assert_eq!(a.get_value::<String>("k").await.unwrap(), "in a");
        assert_eq!(b.get_value::<String>("k").await, None);
        cache.flush().await;
        assert_eq!(a.get_value::<String>("k").await, None);
    }

    #[tokio::test]
    async fn not_found_marker() {
        let cache = SharedCache::new("test_marker", &CacheSettings::default()).await;
        let scope = cache.scoped("metadata");
        scope
            .set_value("/x", &Cached::<u32>::NotFound(NotFound::new("/x")), None)
            .await;
        let err = scope
            .get_value::<Cached<u32>>("/x")
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(cloakfs_protocol::is_not_found(&err));
    }

    #[tokio::test]
    async fn registry_shares_caches() {
        let settings = CacheSettings::default();
        let first = shared_cache("test_registry", &settings).await;
        let second = shared_cache("test_registry", &settings).await;
        assert!(Arc::ptr_eq(&first, &second));
        drop(second);
        let weak = Arc::downgrade(&first);
        release("test_registry", first).await;
        assert!(weak.upgrade().is_none());
    }
}
