pub mod backend;
mod path;
pub mod settings;
pub mod util;

pub use crate::{
    backend::{Backend, ByteStream},
    path::LogicalPath,
};
use {
    chrono::Utc,
    derive_more::Display,
    serde::{Deserialize, Serialize},
};

pub type DateTimeUtc = chrono::DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "dir")]
    Directory,
}

/// Description of a single file or directory.
///
/// Backends return it with `name` set to the storage key. Connections always
/// return it with `name` set to the plaintext logical path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTimeUtc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTimeUtc>,
}

impl Metadata {
    #[must_use]
    #[inline]
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
            ctime: None,
            mtime: None,
        }
    }

    #[must_use]
    #[inline]
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: None,
            ctime: None,
            mtime: None,
        }
    }

    #[must_use]
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// The requested path or key does not exist.
///
/// Carried inside `anyhow::Error`; use [`is_not_found`] to detect it.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[display("not found: {path}")]
pub struct NotFound {
    pub path: String,
}

impl NotFound {
    #[must_use]
    #[inline]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl std::error::Error for NotFound {}

#[must_use]
#[inline]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<NotFound>())
}
