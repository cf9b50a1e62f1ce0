mod mirror;

pub use self::mirror::MirrorResults;

use {
    crate::{
        cache::{Cache, CacheStats, SharedCache, release, shared_cache},
        crypto::EncryptionConfig,
        engine::{EncryptedStorage, JobQueue},
        plain::PlainStorage,
        storage::{Storage, Visitor},
    },
    anyhow::{Context as _, Result, bail, ensure},
    base64::{Engine, prelude::BASE64_STANDARD},
    bytes::Bytes,
    cloakfs_protocol::{
        Backend, ByteStream, LogicalPath, Metadata, is_not_found,
        settings::{CacheSettings, EncryptionSettings},
        util::{collect_stream, single_chunk},
    },
    sha2::{Digest, Sha256},
    std::sync::Arc,
    tracing::{info, warn},
};

const READ_FILE_SCOPE: &str = "read_file";
/// Files smaller than this are kept in the `read_file` cache.
const MAX_CACHED_FILE_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Distinguishes connections to the same driver, e.g. by bucket or account.
    pub identity: String,
    pub read_only: bool,
    pub cache: CacheSettings,
    pub encryption: Option<EncryptionSettings>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub recursive: bool,
    /// Don't fail if the path doesn't exist.
    pub quiet: bool,
}

/// A backend opened for use with logical paths, optionally encrypted and cached.
pub struct Connection {
    id: String,
    storage: Box<dyn Storage>,
    cache: Arc<SharedCache>,
    file_cache: Arc<dyn Cache>,
    read_only: bool,
    encrypted: bool,
    invalidate_on_write: bool,
}

/// Cache identity: connections with equal settings share caches.
fn connection_id(driver_name: &str, options: &ConnectOptions) -> Result<String> {
    let json = serde_json::to_vec(&(&options.identity, &options.cache, &options.encryption))?;
    Ok(format!("{driver_name}_{}", hex::encode(Sha256::digest(json))))
}

impl Connection {
    #[inline]
    pub async fn open(backend: Arc<dyn Backend>, options: ConnectOptions) -> Result<Self> {
        let driver_name = backend.driver_name().to_owned();
        backend
            .test_config()
            .await
            .with_context(|| format!("failed to connect to {driver_name} storage"))?;
        let encryption = options
            .encryption
            .as_ref()
            .map(EncryptionConfig::from_settings)
            .transpose()
            .context("invalid encryption settings")?;
        ensure!(
            !options.cache.distributed_queue || options.cache.host.is_some(),
            "distributed_queue requires a redis host"
        );
        let id = connection_id(&driver_name, &options)?;
        let cache = shared_cache(&id, &options.cache).await;

        let storage: Box<dyn Storage> = match encryption {
            Some(config) => {
                let queue = if options.cache.distributed_queue {
                    if let Some(client) = cache.redis_client() {
                        JobQueue::Redis {
                            client,
                            prefix: format!("{}{id}", options.cache.prefix_or_default()),
                        }
                    } else {
                        warn!("redis is unreachable, resolving metadata in this process");
                        JobQueue::Local
                    }
                } else {
                    JobQueue::Local
                };
                info!(
                    driver = %driver_name,
                    algorithm = %config.algorithm(),
                    dir_levels = config.dir_levels(),
                    "opened encrypted connection"
                );
                Box::new(EncryptedStorage::new(backend, config, &cache, queue))
            }
            None => {
                info!(driver = %driver_name, "opened plain connection");
                Box::new(PlainStorage::new(backend))
            }
        };
        Ok(Self {
            id,
            storage,
            file_cache: cache.scoped(READ_FILE_SCOPE),
            cache,
            read_only: options.read_only,
            encrypted: options.encryption.is_some(),
            invalidate_on_write: options.cache.invalidate_on_write,
        })
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    #[must_use]
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub async fn list(&self, path: &LogicalPath, recursive: bool) -> Result<Vec<Metadata>> {
        self.storage.list(path, recursive, None).await
    }

    #[inline]
    pub async fn list_with_visitor(
        &self,
        path: &LogicalPath,
        recursive: bool,
        visitor: &mut dyn Visitor,
    ) -> Result<Vec<Metadata>> {
        self.storage.list(path, recursive, Some(visitor)).await
    }

    /// Like [`list`](Self::list), but a missing path results in an empty list.
    #[inline]
    pub async fn safe_list(&self, path: &LogicalPath, recursive: bool) -> Result<Vec<Metadata>> {
        match self.list(path, recursive).await {
            Err(err) if is_not_found(&err) => Ok(Vec::new()),
            other => other,
        }
    }

    #[inline]
    pub async fn metadata(&self, path: &LogicalPath) -> Result<Metadata> {
        self.storage.metadata(path).await
    }

    #[inline]
    pub async fn safe_metadata(&self, path: &LogicalPath) -> Result<Option<Metadata>> {
        match self.metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[inline]
    pub async fn read(&self, path: &LogicalPath) -> Result<ByteStream> {
        self.storage.read(path).await
    }

    /// Reads the whole file. Small files are cached.
    #[inline]
    pub async fn read_file(&self, path: &LogicalPath) -> Result<Bytes> {
        if let Some(encoded) = self.file_cache.get_value::<String>(path.as_str()).await {
            match BASE64_STANDARD.decode(encoded) {
                Ok(data) => return Ok(data.into()),
                Err(err) => warn!(?err, %path, "invalid cached file content"),
            }
        }
        let data = collect_stream(self.read(path).await?).await?;
        if data.len() < MAX_CACHED_FILE_SIZE {
            self.file_cache
                .set_value(path.as_str(), &BASE64_STANDARD.encode(&data), None)
                .await;
        }
        Ok(data)
    }

    #[inline]
    pub async fn safe_read_file(&self, path: &LogicalPath) -> Result<Option<Bytes>> {
        match self.read_file(path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn check_writable(&self, path: &LogicalPath) -> Result<()> {
        if self.read_only {
            bail!("cannot modify {path}: connection is read-only");
        }
        Ok(())
    }

    async fn after_mutation(&self) {
        if self.invalidate_on_write {
            self.cache.flush().await;
        }
    }

    /// Stores `source` at `path`, creating parent directories as needed.
    /// Returns the number of bytes written.
    #[inline]
    pub async fn write(&self, path: &LogicalPath, source: ByteStream) -> Result<u64> {
        self.check_writable(path)?;
        let result = self.storage.write(path, source).await;
        self.after_mutation().await;
        result
    }

    #[inline]
    pub async fn write_file(&self, path: &LogicalPath, data: impl Into<Bytes>) -> Result<u64> {
        self.write(path, single_chunk(data)).await
    }

    /// Returns logical paths of removed entries.
    #[inline]
    pub async fn remove(&self, path: &LogicalPath, options: RemoveOptions) -> Result<Vec<String>> {
        self.check_writable(path)?;
        let result = self
            .storage
            .remove(path, options.recursive, options.quiet)
            .await;
        self.after_mutation().await;
        result
    }

    /// Drops all cached entries of this connection.
    #[inline]
    pub async fn flush(&self) {
        self.cache.flush().await;
    }

    /// Hit/miss counters of the Redis cache, if one is used.
    #[must_use]
    #[inline]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.stats()
    }

    /// Stops metadata workers and releases the cache.
    #[inline]
    pub async fn destroy(self) {
        self.storage.shutdown().await;
        let Self { id, cache, file_cache, .. } = self;
        drop(file_cache);
        release(&id, cache).await;
    }
}
