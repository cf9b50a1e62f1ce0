use {
    crate::storage::{Storage, Visitor},
    anyhow::Result,
    async_trait::async_trait,
    cloakfs_protocol::{Backend, ByteStream, LogicalPath, Metadata, NotFound, is_not_found},
    std::sync::Arc,
    tracing::instrument,
};

/// Unencrypted storage: logical paths are used as backend keys directly.
pub struct PlainStorage {
    backend: Arc<dyn Backend>,
}

impl PlainStorage {
    #[must_use]
    #[inline]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

fn to_logical(mut metadata: Metadata) -> Metadata {
    if !metadata.name.starts_with('/') {
        metadata.name.insert(0, '/');
    }
    metadata
}

fn map_not_found(err: anyhow::Error, path: &LogicalPath) -> anyhow::Error {
    if is_not_found(&err) {
        NotFound::new(path.as_str()).into()
    } else {
        err
    }
}

#[async_trait]
impl Storage for PlainStorage {
    #[instrument(skip_all, fields(%path, recursive = recursive))]
    async fn list(
        &self,
        path: &LogicalPath,
        recursive: bool,
        mut visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>> {
        let entries = self
            .backend
            .list(path.as_relative(), recursive)
            .await
            .map_err(|err| map_not_found(err, path))?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = to_logical(entry);
            if let Some(visitor) = visitor.as_deref_mut() {
                visitor.visit(&entry).await?;
            }
            out.push(entry);
        }
        Ok(out)
    }

    async fn metadata(&self, path: &LogicalPath) -> Result<Metadata> {
        let mut metadata = self
            .backend
            .metadata(path.as_relative())
            .await
            .map_err(|err| map_not_found(err, path))?;
        metadata.name = path.to_string();
        Ok(metadata)
    }

    async fn read(&self, path: &LogicalPath) -> Result<ByteStream> {
        self.backend
            .read(path.as_relative())
            .await
            .map_err(|err| map_not_found(err, path))
    }

    #[instrument(skip_all, fields(%path))]
    async fn write(&self, path: &LogicalPath, source: ByteStream) -> Result<u64> {
        self.backend.write(path.as_relative(), source).await
    }

    #[instrument(skip_all, fields(%path, recursive = recursive, quiet = quiet))]
    async fn remove(
        &self,
        path: &LogicalPath,
        recursive: bool,
        quiet: bool,
    ) -> Result<Vec<String>> {
        let removed = self
            .backend
            .remove(path.as_relative(), recursive, quiet)
            .await
            .map_err(|err| map_not_found(err, path))?;
        Ok(removed
            .into_iter()
            .map(|key| {
                if key.starts_with('/') {
                    key
                } else {
                    format!("/{key}")
                }
            })
            .collect())
    }
}
