use {
    super::Connection,
    crate::storage::Visitor,
    anyhow::Result,
    async_trait::async_trait,
    cloakfs_protocol::{LogicalPath, Metadata},
    serde::Serialize,
    tracing::{debug, info, instrument, warn},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorResults {
    /// Files copied.
    pub success: u64,
    /// Files already present with the same size.
    pub skipped: u64,
    pub errors: u64,
}

struct MirrorVisitor<'a> {
    source: &'a Connection,
    dest: &'a Connection,
    source_root: &'a LogicalPath,
    dest_root: &'a LogicalPath,
    results: MirrorResults,
}

impl MirrorVisitor<'_> {
    /// Returns false if the file was skipped.
    async fn copy(&self, entry: &Metadata) -> Result<bool> {
        let source_path = LogicalPath::parse(&entry.name)?;
        let dest_path = match source_path.strip_prefix(self.source_root) {
            Some(relative) => self.dest_root.join_multiple(relative)?,
            None => self.dest_root.clone(),
        };
        if let Some(existing) = self.dest.safe_metadata(&dest_path).await? {
            if !existing.is_dir() && existing.size.is_some() && existing.size == entry.size {
                debug!(%dest_path, "same size, skipping");
                return Ok(false);
            }
        }
        let source = self.source.read(&source_path).await?;
        self.dest.write(&dest_path, source).await?;
        debug!(%source_path, %dest_path, "copied");
        Ok(true)
    }
}

#[async_trait]
impl<'a> Visitor for MirrorVisitor<'a> {
    async fn visit(&mut self, entry: &Metadata) -> Result<()> {
        if entry.is_dir() {
            return Ok(());
        }
        match self.copy(entry).await {
            Ok(true) => self.results.success = self.results.success.saturating_add(1),
            Ok(false) => self.results.skipped = self.results.skipped.saturating_add(1),
            Err(err) => {
                warn!(?err, entry = %entry.name, "failed to mirror file");
                self.results.errors = self.results.errors.saturating_add(1);
            }
        }
        Ok(())
    }
}

impl Connection {
    /// Copies every file below `source_path` of `source` to `dest_path` of this
    /// connection. Files whose size already matches are skipped. Failures of
    /// individual files are counted and don't stop the walk.
    #[instrument(skip_all, fields(%source_path, %dest_path))]
    #[inline]
    pub async fn mirror(
        &self,
        source: &Connection,
        dest_path: &LogicalPath,
        source_path: &LogicalPath,
    ) -> Result<MirrorResults> {
        let mut visitor = MirrorVisitor {
            source,
            dest: self,
            source_root: source_path,
            dest_root: dest_path,
            results: MirrorResults::default(),
        };
        source
            .list_with_visitor(source_path, true, &mut visitor)
            .await?;
        info!(results = ?visitor.results, "mirror finished");
        Ok(visitor.results)
    }
}
