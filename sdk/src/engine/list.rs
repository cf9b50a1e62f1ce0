use {
    super::EncryptedStorage,
    crate::{cache::Cached, storage::Visitor},
    anyhow::Result,
    cloakfs_protocol::{LogicalPath, Metadata, NotFound, is_not_found},
    std::collections::VecDeque,
    tracing::debug,
};

impl EncryptedStorage {
    pub(super) async fn list_impl(
        &self,
        path: &LogicalPath,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>> {
        // Visitors must see every entry, so cached listings are not used for them.
        if visitor.is_some() {
            return self.list_uncached(path, recursive, visitor).await;
        }
        let cache_key = format!("{path} ~ {recursive}");
        let cache = &self.core.list_cache;
        if let Some(cached) = cache.get_value::<Cached<Vec<Metadata>>>(&cache_key).await {
            return cached.into_result();
        }
        let result = self.list_uncached(path, recursive, None).await;
        match &result {
            Ok(entries) => {
                cache
                    .set_value(&cache_key, &Cached::Value(entries.clone()), None)
                    .await;
            }
            Err(err) if is_not_found(err) => {
                cache
                    .set_value(
                        &cache_key,
                        &Cached::<Vec<Metadata>>::NotFound(NotFound::new(path.as_str())),
                        None,
                    )
                    .await;
            }
            Err(_) => {}
        }
        result
    }

    async fn list_uncached(
        &self,
        path: &LogicalPath,
        recursive: bool,
        mut visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>> {
        let children = match self.resolve_children(path).await {
            Ok(children) if !children.is_empty() || path.is_root() => children,
            Ok(_) => self.single_file(path).await?,
            Err(err) if is_not_found(&err) => {
                if path.is_root() {
                    Vec::new()
                } else {
                    self.single_file(path).await?
                }
            }
            Err(err) => return Err(err),
        };
        for entry in &children {
            if let Some(visitor) = visitor.as_deref_mut() {
                visitor.visit(entry).await?;
            }
        }
        if !recursive {
            return Ok(children);
        }

        let mut queue: VecDeque<LogicalPath> = directories(&children)?.into();
        let mut all = children;
        while let Some(dir) = queue.pop_front() {
            let children = match self.resolve_children(&dir).await {
                Ok(children) => children,
                Err(err) if is_not_found(&err) => {
                    debug!(%dir, "skipping empty directory");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for entry in &children {
                if let Some(visitor) = visitor.as_deref_mut() {
                    visitor.visit(entry).await?;
                }
            }
            queue.extend(directories(&children)?);
            all.extend(children);
        }
        Ok(all)
    }

    /// `path` itself, found through its parent. Used when `path` has no children.
    async fn single_file(&self, path: &LogicalPath) -> Result<Vec<Metadata>> {
        Ok(vec![self.core.find_single_file(path).await?])
    }

    /// Resolves all entries of the dirent directory of `path`.
    /// Fails with `NotFound` if the directory does not exist.
    pub(super) async fn resolve_children(&self, path: &LogicalPath) -> Result<Vec<Metadata>> {
        let dirent = self.core.config.dirent_dir(path);
        let entries = self.core.backend.list(&dirent, false).await?;
        let names: Vec<String> = entries
            .into_iter()
            .filter(|entry| !entry.is_dir())
            .map(|entry| entry.name)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let batch = self.pipeline().await?.resolve_batch(&dirent, names).await?;
        Ok(batch.resolved)
    }
}

fn directories(entries: &[Metadata]) -> Result<Vec<LogicalPath>> {
    entries
        .iter()
        .filter(|entry| entry.is_dir())
        .map(|entry| LogicalPath::parse(&entry.name))
        .collect()
}
