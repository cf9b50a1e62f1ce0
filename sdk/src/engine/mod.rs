//! Encrypted hierarchical storage on top of a flat backend.
//!
//! See [`crypto`](crate::crypto) for the layout of the stored objects.

mod list;
mod remove;
mod write;

use {
    crate::{
        cache::{Cache, Cached, SharedCache},
        crypto::{EncryptionConfig, decrypt_stream, decrypt_str, strip_padding},
        pipeline::{JobHandler, MetaJob, Pipeline},
        storage::{Storage, Visitor},
    },
    anyhow::{Context as _, Result, ensure},
    async_trait::async_trait,
    cloakfs_protocol::{
        Backend, ByteStream, LogicalPath, Metadata, NotFound, is_not_found, util::collect_stream,
    },
    std::sync::Arc,
    tokio::sync::OnceCell,
    tracing::{debug, instrument},
};

const LIST_SCOPE: &str = "enc_list";
const METADATA_SCOPE: &str = "metadata";

/// Where metadata resolution jobs are executed.
#[derive(Clone)]
pub enum JobQueue {
    /// Worker tasks of this process.
    Local,
    /// A Redis list shared by all processes using the same `prefix`.
    Redis {
        client: redis::Client,
        prefix: String,
    },
}

/// State shared by the storage and its metadata workers.
struct EngineCore {
    backend: Arc<dyn Backend>,
    config: EncryptionConfig,
    list_cache: Arc<dyn Cache>,
    metadata_cache: Arc<dyn Cache>,
}

impl EngineCore {
    async fn metadata(&self, path: &LogicalPath) -> Result<Metadata> {
        if let Some(cached) = self
            .metadata_cache
            .get_value::<Cached<Metadata>>(path.as_str())
            .await
        {
            return cached.into_result();
        }
        let result = self.metadata_uncached(path).await;
        match &result {
            Ok(metadata) => {
                self.metadata_cache
                    .set_value(path.as_str(), &Cached::Value(metadata.clone()), None)
                    .await;
            }
            Err(err) if is_not_found(err) => {
                self.metadata_cache
                    .set_value(
                        path.as_str(),
                        &Cached::<Metadata>::NotFound(NotFound::new(path.as_str())),
                        None,
                    )
                    .await;
            }
            Err(_) => {}
        }
        result
    }

    async fn metadata_uncached(&self, path: &LogicalPath) -> Result<Metadata> {
        if path.is_root() {
            return Ok(Metadata::directory(path.as_str()));
        }
        let meta_file = self.read_meta_file(path).await;
        let mut metadata = match self.backend.metadata(&self.config.encrypt_path(path)).await {
            Ok(metadata) => metadata,
            Err(err) if is_not_found(&err) => {
                if self.has_children(path).await? {
                    Metadata::directory(path.as_str())
                } else {
                    return Err(NotFound::new(path.as_str()).into());
                }
            }
            Err(err) => return Err(err.context(format!("failed to fetch metadata of {path}"))),
        };
        if let Some(meta_file) = meta_file {
            metadata.kind = meta_file.kind;
            if meta_file.size.is_some() {
                metadata.size = meta_file.size;
            }
        }
        metadata.name = path.to_string();
        Ok(metadata)
    }

    /// Size and type stored next to the content. Unreadable meta files are ignored.
    async fn read_meta_file(&self, path: &LogicalPath) -> Option<Metadata> {
        match self.try_read_meta_file(path).await {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                if !is_not_found(&err) {
                    debug!(?err, %path, "ignoring unreadable meta file");
                }
                None
            }
        }
    }

    async fn try_read_meta_file(&self, path: &LogicalPath) -> Result<Metadata> {
        let stream = self.backend.read(&self.config.meta_path(path)).await?;
        let data = collect_stream(stream).await?;
        let json = decrypt_str(std::str::from_utf8(&data)?, Some(&self.config))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Returns true if the dirent directory of `path` has at least one pointer.
    async fn has_children(&self, path: &LogicalPath) -> Result<bool> {
        match self
            .backend
            .list(&self.config.dirent_dir(path), false)
            .await
        {
            Ok(entries) => Ok(!entries.is_empty()),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Decrypts the logical path stored in a pointer file.
    async fn read_pointer(&self, key: &str) -> Result<LogicalPath> {
        let data = collect_stream(self.backend.read(key).await?).await?;
        ensure!(!data.is_empty(), "directory entry {key} is empty");
        let text = std::str::from_utf8(&data).context("directory entry is not UTF-8")?;
        let plain = decrypt_str(text, Some(&self.config))
            .with_context(|| format!("failed to decrypt directory entry {key}"))?;
        LogicalPath::parse(strip_padding(&plain))
    }

    /// Finds `path` through the pointer file in its parent's dirent directory.
    async fn find_single_file(&self, path: &LogicalPath) -> Result<Metadata> {
        let Some(parent) = path.parent() else {
            return Err(NotFound::new(path.as_str()).into());
        };
        let pointer = self
            .config
            .dirent_file(&self.config.dirent_dir(&parent), path);
        match self.backend.metadata(&pointer).await {
            Ok(_) => self.metadata(path).await,
            Err(err) if is_not_found(&err) => Err(NotFound::new(path.as_str()).into()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl JobHandler for EngineCore {
    async fn handle(&self, job: &MetaJob) -> Result<Metadata> {
        let file_name = job
            .entry_name
            .rsplit('/')
            .next()
            .unwrap_or(&job.entry_name);
        let path = self
            .read_pointer(&format!("{}/{file_name}", job.dirent))
            .await?;
        self.metadata(&path).await
    }
}

/// Storage that encrypts file contents and hides all logical paths.
pub struct EncryptedStorage {
    core: Arc<EngineCore>,
    queue: JobQueue,
    pipeline: OnceCell<Pipeline>,
}

impl EncryptedStorage {
    #[must_use]
    #[inline]
    pub fn new(
        backend: Arc<dyn Backend>,
        config: EncryptionConfig,
        cache: &SharedCache,
        queue: JobQueue,
    ) -> Self {
        Self {
            core: Arc::new(EngineCore {
                backend,
                config,
                list_cache: cache.scoped(LIST_SCOPE),
                metadata_cache: cache.scoped(METADATA_SCOPE),
            }),
            queue,
            pipeline: OnceCell::new(),
        }
    }

    #[must_use]
    #[inline]
    pub fn config(&self) -> &EncryptionConfig {
        &self.core.config
    }

    /// Metadata workers, started on first use.
    async fn pipeline(&self) -> Result<&Pipeline> {
        self.pipeline
            .get_or_try_init(|| async {
                let handler = Arc::clone(&self.core) as Arc<dyn JobHandler>;
                let workers = self.core.config.meta_workers();
                match &self.queue {
                    JobQueue::Local => Ok(Pipeline::local(handler, workers)),
                    JobQueue::Redis { client, prefix } => {
                        Pipeline::distributed(handler, workers, client.clone(), prefix).await
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl Storage for EncryptedStorage {
    #[instrument(skip_all, fields(%path, recursive = recursive))]
    async fn list(
        &self,
        path: &LogicalPath,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>> {
        self.list_impl(path, recursive, visitor).await
    }

    #[instrument(skip_all, fields(%path))]
    async fn metadata(&self, path: &LogicalPath) -> Result<Metadata> {
        self.core.metadata(path).await
    }

    #[instrument(skip_all, fields(%path))]
    async fn read(&self, path: &LogicalPath) -> Result<ByteStream> {
        let source = match self.core.backend.read(&self.core.config.encrypt_path(path)).await {
            Ok(source) => source,
            Err(err) if is_not_found(&err) => return Err(NotFound::new(path.as_str()).into()),
            Err(err) => return Err(err),
        };
        Ok(decrypt_stream(&self.core.config, source))
    }

    #[instrument(skip_all, fields(%path))]
    async fn write(&self, path: &LogicalPath, source: ByteStream) -> Result<u64> {
        self.write_impl(path, source).await
    }

    #[instrument(skip_all, fields(%path, recursive = recursive, quiet = quiet))]
    async fn remove(
        &self,
        path: &LogicalPath,
        recursive: bool,
        quiet: bool,
    ) -> Result<Vec<String>> {
        self.remove_impl(path, recursive, quiet).await
    }

    async fn shutdown(&self) {
        if let Some(pipeline) = self.pipeline.get() {
            pipeline.shutdown();
        }
    }
}
