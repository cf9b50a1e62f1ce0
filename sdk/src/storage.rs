use {
    anyhow::Result,
    async_trait::async_trait,
    cloakfs_protocol::{ByteStream, LogicalPath, Metadata},
};

/// Receives listed entries one by one, as soon as they are resolved.
#[async_trait]
pub trait Visitor: Send {
    async fn visit(&mut self, entry: &Metadata) -> Result<()>;
}

/// Hierarchical storage addressed by logical paths.
///
/// All returned metadata has `name` set to the logical path of the entry.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Lists the children of `path` (or all descendants with `recursive`).
    /// If `path` is a file, returns just the file.
    async fn list(
        &self,
        path: &LogicalPath,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>>;

    async fn metadata(&self, path: &LogicalPath) -> Result<Metadata>;

    async fn read(&self, path: &LogicalPath) -> Result<ByteStream>;

    /// Returns the number of bytes of `source` that were stored.
    async fn write(&self, path: &LogicalPath, source: ByteStream) -> Result<u64>;

    /// Returns logical paths of removed entries.
    async fn remove(&self, path: &LogicalPath, recursive: bool, quiet: bool)
    -> Result<Vec<String>>;

    /// Releases background workers.
    async fn shutdown(&self) {}
}
