use {
    derivative::Derivative,
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_CACHE_PREFIX: &str = "_cloakfs__";
pub const DEFAULT_LRU_SIZE: usize = 100;

/// User-supplied encryption settings of a connection.
///
/// `key` and `iv` are free-form secrets; they are normalized into the actual
/// cipher key and IV when the connection is opened.
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct EncryptionSettings {
    #[derivative(Debug = "ignore")]
    pub key: String,
    #[derivative(Debug = "ignore")]
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub dir_levels: Option<usize>,
    #[serde(default)]
    pub meta_workers: Option<usize>,
}

impl EncryptionSettings {
    #[must_use]
    #[inline]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            iv: None,
            algorithm: None,
            dir_levels: None,
            meta_workers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// With `false`, every cache operation is a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Redis host. Without it, only in-process LRU caches are used.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Max number of entries of each in-process scoped cache.
    #[serde(default = "default_lru_size")]
    pub lru_size: usize,
    /// Expiration of cache entries. Redis entries default to one day.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Flush the connection's cache after every write and remove.
    #[serde(default = "default_true")]
    pub invalidate_on_write: bool,
    /// Resolve directory entries through a Redis job queue instead of
    /// an in-process worker pool. Requires `host`.
    #[serde(default)]
    pub distributed_queue: bool,
}

impl CacheSettings {
    #[must_use]
    #[inline]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    #[inline]
    pub fn redis(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }

    #[must_use]
    #[inline]
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_REDIS_PORT)
    }

    #[must_use]
    #[inline]
    pub fn prefix_or_default(&self) -> &str {
        self.prefix.as_deref().unwrap_or(DEFAULT_CACHE_PREFIX)
    }
}

impl Default for CacheSettings {
    #[inline]
    fn default() -> Self {
        Self {
            enabled: true,
            host: None,
            port: None,
            prefix: None,
            lru_size: DEFAULT_LRU_SIZE,
            ttl: None,
            invalidate_on_write: true,
            distributed_queue: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_lru_size() -> usize {
    DEFAULT_LRU_SIZE
}
