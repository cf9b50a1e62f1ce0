use {
    super::EncryptedStorage,
    crate::crypto::{encrypt_str, encrypt_stream},
    anyhow::{Context as _, Result, ensure},
    cloakfs_protocol::{ByteStream, LogicalPath, Metadata, util::single_chunk},
    std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    tracing::debug,
};

impl EncryptedStorage {
    /// Links `path` and all its ancestors into the tree, then stores the
    /// content and the meta file. Rewriting an existing path is harmless.
    pub(super) async fn write_impl(&self, path: &LogicalPath, source: ByteStream) -> Result<u64> {
        ensure!(!path.is_root(), "cannot write to the root directory");
        let config = &self.core.config;
        let backend = &self.core.backend;

        let mut child = path.clone();
        while let Some(parent) = child.parent() {
            let dirent = config.dirent_dir(&parent);
            let pointer = config.dirent_file(&dirent, &child);
            let content = encrypt_str(
                &format!("{child}{}", config.path_padding()),
                Some(config),
            );
            let written = backend
                .write(&pointer, single_chunk(content))
                .await
                .with_context(|| format!("failed to write directory entry of {child}"))?;
            ensure!(written > 0, "failed to write directory entry of {child}");
            child = parent;
        }

        let counter = Arc::new(AtomicU64::new(0));
        backend
            .write(
                &config.encrypt_path(path),
                encrypt_stream(config, source, Arc::clone(&counter)),
            )
            .await
            .with_context(|| format!("failed to write content of {path}"))?;
        let size = counter.load(Ordering::Relaxed);

        let meta = serde_json::to_string(&Metadata::file(path.as_str(), size))?;
        backend
            .write(&config.meta_path(path), single_chunk(encrypt_str(&meta, Some(config))))
            .await
            .with_context(|| format!("failed to write meta file of {path}"))?;
        debug!(%path, size, "file written");
        Ok(size)
    }
}
