use {
    super::{Cache, LruCache},
    anyhow::Result,
    async_trait::async_trait,
    cloakfs_protocol::settings::CacheSettings,
    parking_lot::Mutex,
    redis::{AsyncCommands, RedisResult, aio::MultiplexedConnection},
    serde::Serialize,
    std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    },
    tokio::time::timeout,
    tracing::{debug, info, warn},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const STATS_INTERVAL: u64 = 1000;
const SCAN_COUNT: u64 = 1000;

#[derive(Debug, Default)]
struct Counters {
    get: AtomicU64,
    set: AtomicU64,
    del: AtomicU64,
    flush: AtomicU64,
    hit: AtomicU64,
    miss: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub get: u64,
    pub set: u64,
    pub del: u64,
    pub flush: u64,
    pub hit: u64,
    pub miss: u64,
}

impl CacheStats {
    /// Percentage of gets that were hits.
    #[must_use]
    #[inline]
    #[expect(
        clippy::as_conversions,
        clippy::cast_precision_loss,
        reason = "approximate ratio"
    )]
    pub fn hit_rate(&self) -> f64 {
        if self.get == 0 {
            0.0
        } else {
            100.0 * self.hit as f64 / self.get as f64
        }
    }
}

/// Cache stored in Redis under a per-connection key prefix.
///
/// If the server can't be reached when the cache is created, the cache stays
/// in unreachable mode: every operation is a miss or a no-op, and scopes are
/// served by in-process caches instead.
pub struct RedisCache {
    name: String,
    prefix: String,
    client: Option<redis::Client>,
    connection: Mutex<Option<MultiplexedConnection>>,
    default_ttl: Duration,
    /// Configured expiration, also used by the in-process fallback scopes.
    ttl: Option<Duration>,
    lru_size: usize,
    counters: Counters,
}

fn escape_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl RedisCache {
    #[inline]
    pub async fn connect(id: &str, host: &str, settings: &CacheSettings) -> Self {
        let mut cache = Self {
            name: id.to_owned(),
            prefix: format!("{}{id}_", settings.prefix_or_default()),
            client: None,
            connection: Mutex::new(None),
            default_ttl: settings.ttl.unwrap_or(DEFAULT_TTL),
            ttl: settings.ttl,
            lru_size: settings.lru_size,
            counters: Counters::default(),
        };
        let url = format!("redis://{host}:{}/", settings.port_or_default());
        match open(&url).await {
            Ok((client, connection)) => {
                cache.client = Some(client);
                *cache.connection.get_mut() = Some(connection);
                let self_test = cache.try_flush("").await;
                if let Err(err) = self_test {
                    warn!(?err, name = %cache.name, "redis self-test failed, cache is unreachable");
                    cache.client = None;
                    *cache.connection.get_mut() = None;
                } else {
                    info!(name = %cache.name, %host, "connected to redis");
                }
            }
            Err(err) => {
                warn!(?err, name = %cache.name, %host, "failed to connect to redis, cache is unreachable");
            }
        }
        cache
    }

    #[must_use]
    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.connection.lock().is_some()
    }

    #[must_use]
    #[inline]
    pub fn client(&self) -> Option<redis::Client> {
        if self.is_reachable() {
            self.client.clone()
        } else {
            None
        }
    }

    #[must_use]
    #[inline]
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            get: c.get.load(Ordering::Relaxed),
            set: c.set.load(Ordering::Relaxed),
            del: c.del.load(Ordering::Relaxed),
            flush: c.flush.load(Ordering::Relaxed),
            hit: c.hit.load(Ordering::Relaxed),
            miss: c.miss.load(Ordering::Relaxed),
        }
    }

    /// Cache stored under `:scoped:{name}_` inside this cache's prefix.
    #[must_use]
    #[inline]
    pub fn scoped(self: &Arc<Self>, name: &str) -> Arc<dyn Cache> {
        if self.is_reachable() {
            Arc::new(ScopedRedisCache {
                parent: Arc::clone(self),
                scope: format!(":scoped:{name}_"),
            })
        } else {
            debug!(cache = %self.name, scope = name, "redis is unreachable, using in-process cache");
            Arc::new(LruCache::new(self.lru_size, self.ttl))
        }
    }

    fn connection(&self) -> Option<MultiplexedConnection> {
        self.connection.lock().clone()
    }

    async fn get_key(&self, key: &str) -> Option<String> {
        let count = self
            .counters
            .get
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        if count % STATS_INTERVAL == 0 {
            let stats = self.stats();
            info!(cache = %self.name, ?stats, hit_rate = stats.hit_rate(), "cache stats");
        }
        let value = match self.connection() {
            Some(mut connection) => {
                let result: RedisResult<Option<String>> =
                    connection.get(format!("{}{key}", self.prefix)).await;
                result.unwrap_or_else(|err| {
                    warn!(?err, cache = %self.name, key, "redis get failed");
                    None
                })
            }
            None => None,
        };
        let counter = if value.is_some() {
            &self.counters.hit
        } else {
            &self.counters.miss
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    async fn set_key(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.counters.set.fetch_add(1, Ordering::Relaxed);
        let Some(mut connection) = self.connection() else {
            return;
        };
        let seconds = ttl.unwrap_or(self.default_ttl).as_secs().max(1);
        let result: RedisResult<()> = connection
            .set_ex(format!("{}{key}", self.prefix), value, seconds)
            .await;
        if let Err(err) = result {
            warn!(?err, cache = %self.name, key, "redis set failed");
        }
    }

    /// Deletes every key of this cache that starts with `sub_prefix`.
    async fn try_flush(&self, sub_prefix: &str) -> Result<()> {
        self.counters.flush.fetch_add(1, Ordering::Relaxed);
        let Some(mut connection) = self.connection() else {
            return Ok(());
        };
        let pattern = format!("{}*", escape_pattern(&format!("{}{sub_prefix}", self.prefix)));
        let mut cursor = 0_u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut connection)
                .await?;
            if !keys.is_empty() {
                let deleted: u64 = connection.del(&keys).await?;
                self.counters.del.fetch_add(deleted, Ordering::Relaxed);
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    async fn flush_prefix(&self, sub_prefix: &str) {
        if let Err(err) = self.try_flush(sub_prefix).await {
            warn!(?err, cache = %self.name, sub_prefix, "redis flush failed");
        }
    }
}

async fn open(url: &str) -> Result<(redis::Client, MultiplexedConnection)> {
    let client = redis::Client::open(url)?;
    let connection = timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection()).await??;
    Ok((client, connection))
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        self.get_key(key).await
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.set_key(key, value, ttl).await;
    }

    async fn flush(&self) {
        self.flush_prefix("").await;
    }

    async fn disconnect(&self) {
        if self.connection.lock().take().is_some() {
            debug!(cache = %self.name, "disconnected from redis");
        }
    }
}

struct ScopedRedisCache {
    parent: Arc<RedisCache>,
    scope: String,
}

#[async_trait]
impl Cache for ScopedRedisCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        self.parent.get_key(&format!("{}{key}", self.scope)).await
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.parent
            .set_key(&format!("{}{key}", self.scope), value, ttl)
            .await;
    }

    async fn flush(&self) {
        self.parent.flush_prefix(&self.scope).await;
    }

    /// The connection belongs to the parent cache.
    async fn disconnect(&self) {}
}

/// Redis server for tests, from `CLOAKFS_TEST_REDIS_HOST` and `CLOAKFS_TEST_REDIS_PORT`
/// (default `127.0.0.1:6379`). Returns `None` if it doesn't answer, so tests
/// depending on it can be skipped.
#[cfg(test)]
pub(crate) async fn test_redis_server() -> Option<(String, u16)> {
    let host = std::env::var("CLOAKFS_TEST_REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port = std::env::var("CLOAKFS_TEST_REDIS_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(cloakfs_protocol::settings::DEFAULT_REDIS_PORT);
    let (_, mut connection) = open(&format!("redis://{host}:{port}/")).await.ok()?;
    let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut connection).await;
    pong.ok().map(|_| (host, port))
}
