//! Contract implemented by storage drivers.
//!
//! A backend is a flat key/value object store. Keys are `/`-separated strings,
//! but a backend is not required to have any notion of directories: listing a
//! key returns the objects stored below it, and a key with nothing below it
//! may be reported as [`NotFound`](crate::NotFound).

use {
    crate::Metadata,
    anyhow::Result,
    async_trait::async_trait,
    bytes::Bytes,
    futures::stream::BoxStream,
};

/// Finite, single-pass sequence of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short driver name, part of the connection identity.
    fn driver_name(&self) -> &str;

    /// Checks that the backend is reachable and correctly configured.
    async fn test_config(&self) -> Result<()>;

    /// Lists objects below `key`. Fails with `NotFound` if `key` does not exist.
    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<Metadata>>;

    async fn metadata(&self, key: &str) -> Result<Metadata>;

    async fn read(&self, key: &str) -> Result<ByteStream>;

    /// Stores the whole `source` at `key`, replacing any previous object.
    /// Returns the number of bytes written.
    async fn write(&self, key: &str, source: ByteStream) -> Result<u64>;

    /// Removes `key`. With `quiet`, a missing key is not an error.
    /// Returns the removed keys.
    async fn remove(&self, key: &str, recursive: bool, quiet: bool) -> Result<Vec<String>>;
}
