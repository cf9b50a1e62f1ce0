use {
    super::EncryptedStorage,
    anyhow::{Result, bail},
    cloakfs_protocol::{LogicalPath, NotFound, is_not_found},
    futures::{FutureExt, future::BoxFuture},
    tracing::{debug, warn},
};

impl EncryptedStorage {
    pub(super) async fn remove_impl(
        &self,
        path: &LogicalPath,
        recursive: bool,
        quiet: bool,
    ) -> Result<Vec<String>> {
        if !path.is_root() && !self.is_linked(path).await? {
            if quiet {
                return Ok(Vec::new());
            }
            return Err(NotFound::new(path.as_str()).into());
        }
        let mut removed = Vec::new();
        if recursive {
            self.remove_tree(path, quiet, &mut removed).await?;
        } else {
            if path.is_root() {
                bail!("cannot remove the root directory without recursion");
            }
            if self.core.has_children(path).await? {
                // A file that also has children: drop the content and keep the
                // pointer so the children stay reachable.
                if !self.has_content(path).await? {
                    bail!("{path} is a non-empty directory");
                }
                self.remove_content(path).await?;
                removed.push(path.to_string());
                return Ok(removed);
            }
            self.unlink(path).await?;
            removed.push(path.to_string());
        }
        self.prune_empty_ancestors(path).await?;
        Ok(removed)
    }

    /// Returns true if the parent of `path` has a pointer to it.
    async fn is_linked(&self, path: &LogicalPath) -> Result<bool> {
        let Some(parent) = path.parent() else {
            return Ok(true);
        };
        let config = &self.core.config;
        let pointer = config.dirent_file(&config.dirent_dir(&parent), path);
        match self.core.backend.metadata(&pointer).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Returns true if `path` has its own content key.
    async fn has_content(&self, path: &LogicalPath) -> Result<bool> {
        match self
            .core
            .backend
            .metadata(&self.core.config.encrypt_path(path))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn remove_content(&self, path: &LogicalPath) -> Result<()> {
        let config = &self.core.config;
        for key in [config.encrypt_path(path), config.meta_path(path)] {
            self.core.backend.remove(&key, false, true).await?;
        }
        debug!(%path, "content removed");
        Ok(())
    }

    /// Removes the pointer, the content and the meta file of `path`.
    async fn unlink(&self, path: &LogicalPath) -> Result<()> {
        let Some(parent) = path.parent() else {
            bail!("cannot remove the root directory");
        };
        let config = &self.core.config;
        self.core
            .backend
            .remove(&config.dirent_file(&config.dirent_dir(&parent), path), false, true)
            .await?;
        self.remove_content(path).await?;
        debug!(%path, "removed");
        Ok(())
    }

    /// Depth-first removal of `path` and everything below it.
    fn remove_tree<'a>(
        &'a self,
        path: &'a LogicalPath,
        quiet: bool,
        removed: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let children = match self.resolve_children(path).await {
                Ok(children) => children,
                Err(err) if is_not_found(&err) => Vec::new(),
                Err(err) if quiet => {
                    warn!(?err, %path, "failed to list directory for removal");
                    Vec::new()
                }
                Err(err) => return Err(err.context(format!("failed to list {path} for removal"))),
            };
            for child in children {
                let child = LogicalPath::parse(&child.name)?;
                self.remove_tree(&child, quiet, removed).await?;
            }
            self.core
                .backend
                .remove(&self.core.config.dirent_dir(path), true, true)
                .await?;
            if !path.is_root() {
                self.unlink(path).await?;
                removed.push(path.to_string());
            }
            Ok(())
        }
        .boxed()
    }

    /// Unlinks ancestors of `path` that no longer have any children.
    /// Stops at the root and at ancestors that are also files.
    async fn prune_empty_ancestors(&self, path: &LogicalPath) -> Result<()> {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.is_root()
                || self.core.has_children(&dir).await?
                || self.has_content(&dir).await?
            {
                break;
            }
            self.unlink(&dir).await?;
            current = dir.parent();
        }
        Ok(())
    }
}
