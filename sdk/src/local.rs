use {
    anyhow::{Result, bail, ensure},
    async_trait::async_trait,
    cadd::prelude::IntoType,
    chrono::{DateTime, Utc},
    cloakfs_protocol::{Backend, ByteStream, Metadata, NotFound, util::stream_file},
    futures::TryStreamExt,
    std::{
        io::{self, ErrorKind},
        path::{Path, PathBuf},
    },
    tokio::io::AsyncWriteExt,
    tracing::{debug, warn},
};

/// Backend storing every key as a file below a root directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

fn normalize_key(key: &str) -> Result<&str> {
    let key = key.trim_matches('/');
    if !key.is_empty() {
        for component in key.split('/') {
            ensure!(
                !component.is_empty() && component != "." && component != "..",
                "invalid storage key: {key:?}"
            );
        }
    }
    Ok(key)
}

fn join_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

fn convert_error(err: io::Error, key: &str) -> anyhow::Error {
    if err.kind() == ErrorKind::NotFound {
        NotFound::new(key).into()
    } else {
        err.into()
    }
}

fn entry_metadata(key: String, metadata: &std::fs::Metadata) -> Metadata {
    if metadata.is_dir() {
        return Metadata::directory(key);
    }
    let mut out = Metadata::file(key, metadata.len());
    out.mtime = metadata.modified().ok().map(DateTime::<Utc>::from);
    out.ctime = metadata.created().ok().map(DateTime::<Utc>::from);
    out
}

impl LocalBackend {
    #[must_use]
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<(String, PathBuf)> {
        let key = normalize_key(key)?;
        let path = if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        };
        Ok((key.to_owned(), path))
    }

    /// Removes empty directories above `path`, up to the root.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs_err::tokio::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn driver_name(&self) -> &str {
        "local"
    }

    async fn test_config(&self) -> Result<()> {
        fs_err::tokio::create_dir_all(&self.root).await?;
        let metadata = fs_err::tokio::metadata(&self.root).await?;
        ensure!(metadata.is_dir(), "{} is not a directory", self.root.display());
        Ok(())
    }

    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<Metadata>> {
        let (key, path) = self.resolve(key)?;
        let metadata = fs_err::tokio::metadata(&path)
            .await
            .map_err(|err| convert_error(err, &key))?;
        if !metadata.is_dir() {
            return Ok(vec![entry_metadata(key, &metadata)]);
        }
        let mut out = Vec::new();
        let mut pending = vec![(path, key)];
        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = fs_err::tokio::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    warn!(path = ?entry.path(), "skipping file with non-UTF-8 name");
                    continue;
                };
                let child_key = join_key(&dir_key, &name);
                let metadata = entry.metadata().await?;
                if recursive && metadata.is_dir() {
                    pending.push((entry.path(), child_key.clone()));
                }
                out.push(entry_metadata(child_key, &metadata));
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        let (key, path) = self.resolve(key)?;
        let metadata = fs_err::tokio::metadata(&path)
            .await
            .map_err(|err| convert_error(err, &key))?;
        Ok(entry_metadata(key, &metadata))
    }

    async fn read(&self, key: &str) -> Result<ByteStream> {
        let (key, path) = self.resolve(key)?;
        let metadata = fs_err::tokio::metadata(&path)
            .await
            .map_err(|err| convert_error(err, &key))?;
        if metadata.is_dir() {
            bail!("cannot read {key}: it's a directory");
        }
        let file = fs_err::File::open(&path).map_err(|err| convert_error(err, &key))?;
        Ok(stream_file(file))
    }

    async fn write(&self, key: &str, mut source: ByteStream) -> Result<u64> {
        let (key, path) = self.resolve(key)?;
        ensure!(!key.is_empty(), "cannot write to the storage root");
        if let Some(parent) = path.parent() {
            fs_err::tokio::create_dir_all(parent).await?;
        }
        let mut file = fs_err::tokio::File::create(&path).await?;
        let mut written = 0_u64;
        while let Some(chunk) = source.try_next().await? {
            file.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len().try_into_type::<u64>()?);
        }
        file.flush().await?;
        file.sync_all().await?;
        debug!(%key, written, "stored");
        Ok(written)
    }

    async fn remove(&self, key: &str, recursive: bool, quiet: bool) -> Result<Vec<String>> {
        let (key, path) = self.resolve(key)?;
        ensure!(!key.is_empty(), "cannot remove the storage root");
        let metadata = match fs_err::tokio::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if quiet && err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(convert_error(err, &key)),
        };
        let mut removed = Vec::new();
        if metadata.is_dir() {
            if recursive {
                removed.extend(
                    self.list(&key, true)
                        .await?
                        .into_iter()
                        .map(|entry| entry.name),
                );
                fs_err::tokio::remove_dir_all(&path).await?;
            } else {
                fs_err::tokio::remove_dir(&path).await?;
            }
        } else {
            fs_err::tokio::remove_file(&path).await?;
        }
        removed.push(key);
        self.prune_empty_parents(&path).await;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        cloakfs_protocol::{is_not_found, util::{collect_stream, single_chunk}},
        tempfile::TempDir,
    };

    async fn backend() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path().join("storage"));
        backend.test_config().await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn write_read_list() {
        let (_dir, backend) = backend().await;
        assert_eq!(backend.write("a/b/c", single_chunk("hello")).await.unwrap(), 5);
        backend.write("a/d", single_chunk("x")).await.unwrap();
        let data = collect_stream(backend.read("a/b/c").await.unwrap()).await.unwrap();
        assert_eq!(data.as_ref(), b"hello");

        let names: Vec<_> = backend
            .list("a", false)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, ["a/b", "a/d"]);
        let names: Vec<_> = backend
            .list("/a/", true)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, ["a/b", "a/b/c", "a/d"]);

        let file = backend.list("a/b/c", false).await.unwrap();
        assert_eq!(file.len(), 1);
        assert_eq!(file[0].size, Some(5));
        assert!(backend.metadata("a/b").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn missing_keys() {
        let (_dir, backend) = backend().await;
        assert!(is_not_found(&backend.list("nope", false).await.unwrap_err()));
        assert!(is_not_found(&backend.metadata("nope").await.unwrap_err()));
        assert!(is_not_found(&backend.read("nope").await.err().unwrap()));
        assert!(is_not_found(&backend.remove("nope", false, false).await.unwrap_err()));
        assert!(backend.remove("nope", false, true).await.unwrap().is_empty());
        backend.read("../escape").await.err().unwrap();
    }

    #[tokio::test]
    async fn remove_prunes_empty_parents() {
        let (_dir, backend) = backend().await;
        backend.write("a/b/c", single_chunk("1")).await.unwrap();
        backend.write("a/e", single_chunk("2")).await.unwrap();
        assert_eq!(backend.remove("a/b/c", false, false).await.unwrap(), ["a/b/c"]);
        assert!(is_not_found(&backend.metadata("a/b").await.unwrap_err()));
        assert!(backend.metadata("a").await.unwrap().is_dir());

        let mut removed = backend.remove("a", true, false).await.unwrap();
        removed.sort();
        assert_eq!(removed, ["a", "a/e"]);
        assert!(backend.list("", false).await.unwrap().is_empty());
    }
}
