use {
    anyhow::{Result, bail},
    serde::{Deserialize, Serialize, de::Error},
    std::{fmt, str::FromStr},
};

/// Plaintext path of a file or directory as seen by the user of a connection.
///
/// Always starts with `/`, never ends with `/` (except for the root itself)
/// and never contains empty, `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogicalPath(String);

impl LogicalPath {
    #[must_use]
    #[inline]
    pub fn root() -> Self {
        Self("/".into())
    }

    /// Accepts relative (`a/b`), absolute (`/a/b`) and trailing-slash forms.
    /// An empty string or `.` means the root.
    #[inline]
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed == "." || trimmed == "/" {
            return Ok(Self::root());
        }
        let mut s = if trimmed.starts_with('/') {
            trimmed.to_owned()
        } else {
            format!("/{trimmed}")
        };
        if s.ends_with('/') {
            s.pop();
        }
        check_path(&s)?;
        Ok(Self(s))
    }

    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path without the leading `/`, as used for plain backend keys.
    #[must_use]
    #[inline]
    pub fn as_relative(&self) -> &str {
        self.0.strip_prefix('/').unwrap_or(&self.0)
    }

    #[must_use]
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    #[inline]
    pub fn join_one(&self, file_name: &str) -> Result<LogicalPath> {
        if file_name.is_empty() {
            bail!("file name cannot be empty");
        }
        if file_name.contains('/') {
            bail!("file name cannot contain '/'");
        }
        let s = if self.is_root() {
            format!("/{file_name}")
        } else {
            format!("{}/{file_name}", self.0)
        };
        check_path(&s)?;
        Ok(Self(s))
    }

    /// Appends a relative path, which may contain several components.
    #[inline]
    pub fn join_multiple(&self, relative_path: &str) -> Result<LogicalPath> {
        let relative_path = relative_path.trim_matches('/');
        if relative_path.is_empty() {
            return Ok(self.clone());
        }
        let s = if self.is_root() {
            format!("/{relative_path}")
        } else {
            format!("{}/{relative_path}", self.0)
        };
        check_path(&s)?;
        Ok(Self(s))
    }

    #[must_use]
    #[inline]
    pub fn parent(&self) -> Option<LogicalPath> {
        if self.is_root() {
            None
        } else {
            let pos = self.0.rfind('/')?;
            let parent = self.0.get(..pos).filter(|p| !p.is_empty()).unwrap_or("/");
            Some(Self(parent.into()))
        }
    }

    /// Returns the part of `self` below `base`, or `None` if `self` is not inside `base`.
    #[must_use]
    #[inline]
    pub fn strip_prefix(&self, base: &LogicalPath) -> Option<&str> {
        if base.is_root() {
            self.0.strip_prefix('/').filter(|rest| !rest.is_empty())
        } else {
            self.0
                .strip_prefix(&base.0)
                .and_then(|prefix| prefix.strip_prefix('/'))
        }
    }

    #[must_use]
    #[inline]
    pub fn last_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }
}

#[test]
fn parse_normalizes() {
    assert_eq!(LogicalPath::parse("").unwrap(), LogicalPath::root());
    assert_eq!(LogicalPath::parse(".").unwrap(), LogicalPath::root());
    assert_eq!(LogicalPath::parse("a/b").unwrap().as_str(), "/a/b");
    assert_eq!(LogicalPath::parse("/a/b/").unwrap().as_str(), "/a/b");
    assert_eq!(LogicalPath::parse("/a/b").unwrap().as_relative(), "a/b");
    LogicalPath::parse("/a//b").unwrap_err();
    LogicalPath::parse("/a/../b").unwrap_err();
    LogicalPath::parse("/a/./b").unwrap_err();
}

#[test]
fn parent_path() {
    assert_eq!(LogicalPath::root().parent(), None);
    assert_eq!(
        LogicalPath::parse("/ab").unwrap().parent(),
        Some(LogicalPath::root())
    );
    assert_eq!(
        LogicalPath::parse("/ab/cd").unwrap().parent(),
        Some(LogicalPath::parse("/ab").unwrap())
    );
}

#[test]
fn strip_prefix() {
    fn p(s: &str) -> LogicalPath {
        LogicalPath::parse(s).unwrap()
    }
    assert_eq!(p("/a/b/c/d").strip_prefix(&p("/a/b")), Some("c/d"));
    assert_eq!(p("/a/b/c/d").strip_prefix(&p("/a/b/c/d")), None);
    assert_eq!(p("/a/b/c/d").strip_prefix(&p("/d")), None);
    assert_eq!(p("/a").strip_prefix(&p("/")), Some("a"));
    assert_eq!(p("/").strip_prefix(&p("/")), None);
    assert_eq!(p("/a/b/c/d").strip_prefix(&p("/")), Some("a/b/c/d"));
}

#[test]
fn join_and_last_name() {
    let root = LogicalPath::root();
    let a = root.join_one("a").unwrap();
    assert_eq!(a.as_str(), "/a");
    assert_eq!(a.join_multiple("b/c.txt").unwrap().as_str(), "/a/b/c.txt");
    assert_eq!(a.last_name(), Some("a"));
    assert_eq!(root.last_name(), None);
    root.join_one("x/y").unwrap_err();
}

impl<'de> Deserialize<'de> for LogicalPath {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

impl FromStr for LogicalPath {
    type Err = anyhow::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LogicalPath {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn check_path(path: &str) -> Result<()> {
    if path.contains("//") {
        bail!("path cannot contain '//'");
    }
    if !path.starts_with('/') {
        bail!("path must start with '/'");
    }
    if path != "/" && path.ends_with('/') {
        bail!("path must not end with '/'");
    }
    if path.split('/').any(|part| part == "." || part == "..") {
        bail!("path cannot contain '.' or '..' components");
    }
    Ok(())
}
