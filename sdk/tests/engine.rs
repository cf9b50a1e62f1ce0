#![allow(clippy::unwrap_used, clippy::indexing_slicing, reason = "test")]

use {
    anyhow::Result,
    async_trait::async_trait,
    cloakfs_protocol::{
        EntryKind,
        settings::{CacheSettings, EncryptionSettings},
        util::single_chunk,
    },
    cloakfs_sdk::{
        crypto::EncryptionConfig,
        Backend, ByteStream, ConnectOptions, Connection, LocalBackend, LogicalPath, Metadata,
        RemoveOptions, Visitor, is_not_found,
    },
    std::{
        collections::BTreeSet,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    },
    tempfile::TempDir,
    tokio::time::sleep,
};

const KEY: &str = "correct horse battery staple";

fn p(path: &str) -> LogicalPath {
    LogicalPath::parse(path).unwrap()
}

fn names(entries: &[Metadata]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

/// Counts metadata requests passed to the wrapped backend.
struct CountingBackend {
    inner: LocalBackend,
    metadata_calls: AtomicUsize,
}

#[async_trait]
impl Backend for CountingBackend {
    fn driver_name(&self) -> &str {
        "counting"
    }

    async fn test_config(&self) -> Result<()> {
        self.inner.test_config().await
    }

    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<Metadata>> {
        self.inner.list(key, recursive).await
    }

    async fn metadata(&self, key: &str) -> Result<Metadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.metadata(key).await
    }

    async fn read(&self, key: &str) -> Result<ByteStream> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, source: ByteStream) -> Result<u64> {
        self.inner.write(key, source).await
    }

    async fn remove(&self, key: &str, recursive: bool, quiet: bool) -> Result<Vec<String>> {
        self.inner.remove(key, recursive, quiet).await
    }
}

struct Fixture {
    dir: TempDir,
    backend: Arc<LocalBackend>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path().join("storage")));
        Self { dir, backend }
    }

    fn options(&self, key: Option<&str>) -> ConnectOptions {
        ConnectOptions {
            identity: self.dir.path().display().to_string(),
            encryption: key.map(EncryptionSettings::new),
            ..ConnectOptions::default()
        }
    }

    async fn connect(&self) -> Connection {
        Connection::open(self.backend.clone(), self.options(Some(KEY)))
            .await
            .unwrap()
    }

    async fn stored_keys(&self) -> Vec<String> {
        self.backend
            .list("", true)
            .await
            .unwrap()
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::File)
            .map(|entry| entry.name)
            .collect()
    }
}

#[tokio::test]
async fn nested_file_scenario() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;

    assert_eq!(conn.write_file(&p("/a/b/c.txt"), "hello").await.unwrap(), 5);

    let root = conn.list(&p("/"), false).await.unwrap();
    assert_eq!(names(&root), ["/a"]);
    assert!(root[0].is_dir());
    assert_eq!(names(&conn.list(&p("/a"), false).await.unwrap()), ["/a/b"]);
    let files = conn.list(&p("/a/b"), false).await.unwrap();
    assert_eq!(names(&files), ["/a/b/c.txt"]);
    assert_eq!(files[0].kind, EntryKind::File);
    assert_eq!(files[0].size, Some(5));
    assert_eq!(names(&conn.list(&p("/a/b/c.txt"), false).await.unwrap()), ["/a/b/c.txt"]);

    let all = conn.list(&p("/"), true).await.unwrap();
    assert_eq!(names(&all), ["/a", "/a/b", "/a/b/c.txt"]);

    assert!(conn.metadata(&p("/a/b")).await.unwrap().is_dir());
    assert_eq!(conn.read_file(&p("/a/b/c.txt")).await.unwrap().as_ref(), b"hello");

    for key in fixture.stored_keys().await {
        assert!(!key.contains("c.txt"), "plaintext name in {key}");
    }

    let removed = conn
        .remove(&p("/a/b/c.txt"), RemoveOptions::default())
        .await
        .unwrap();
    assert_eq!(removed, ["/a/b/c.txt"]);
    assert!(conn.list(&p("/"), false).await.unwrap().is_empty());
    assert!(is_not_found(&conn.metadata(&p("/a")).await.unwrap_err()));
    assert!(fixture.stored_keys().await.is_empty());
    conn.destroy().await;
}

#[tokio::test]
async fn rewrite_is_idempotent() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    conn.write_file(&p("/dir/file"), "first version").await.unwrap();
    let keys = fixture.stored_keys().await.len();
    conn.write_file(&p("/dir/file"), "second").await.unwrap();
    assert_eq!(fixture.stored_keys().await.len(), keys);

    let entries = conn.list(&p("/dir"), false).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].size, Some(6));
    assert_eq!(conn.read_file(&p("/dir/file")).await.unwrap().as_ref(), b"second");
}

#[tokio::test]
async fn tree_stays_consistent() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    for path in ["/x/1", "/x/2", "/x/y/3", "/z"] {
        conn.write_file(&p(path), path.to_owned()).await.unwrap();
    }
    conn.remove(&p("/x/2"), RemoveOptions::default())
        .await
        .unwrap();

    let all = conn.list(&p("/"), true).await.unwrap();
    let listed: BTreeSet<_> = names(&all).into_iter().collect();
    assert_eq!(
        listed,
        ["/x", "/x/1", "/x/y", "/x/y/3", "/z"].into_iter().collect()
    );
    for entry in &all {
        let parent = p(&entry.name).parent().unwrap();
        assert!(conn.metadata(&parent).await.unwrap().is_dir());
    }
}

#[tokio::test]
async fn unreadable_entry_is_left_out_of_listing() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    conn.write_file(&p("/d/a"), "a").await.unwrap();
    conn.write_file(&p("/d/b"), "b").await.unwrap();

    let config = EncryptionConfig::from_settings(&EncryptionSettings::new(KEY)).unwrap();
    let pointer = config.dirent_file(&config.dirent_dir(&p("/d")), &p("/d/a"));
    fixture
        .backend
        .write(&pointer, single_chunk("not an encrypted path"))
        .await
        .unwrap();
    conn.flush().await;

    assert_eq!(names(&conn.list(&p("/d"), false).await.unwrap()), ["/d/b"]);
    assert_eq!(
        names(&conn.list(&p("/"), true).await.unwrap()),
        ["/d", "/d/b"]
    );
}

#[tokio::test]
async fn recursive_remove_is_complete() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    for path in ["/d/x", "/d/y/z", "/d/y/w", "/keep"] {
        conn.write_file(&p(path), "data").await.unwrap();
    }
    let removed = conn
        .remove(
            &p("/d"),
            RemoveOptions {
                recursive: true,
                quiet: false,
            },
        )
        .await
        .unwrap();
    let removed: BTreeSet<_> = removed.iter().map(String::as_str).collect();
    assert_eq!(
        removed,
        ["/d", "/d/x", "/d/y", "/d/y/z", "/d/y/w"].into_iter().collect()
    );
    assert_eq!(names(&conn.list(&p("/"), true).await.unwrap()), ["/keep"]);

    conn.remove(&p("/keep"), RemoveOptions::default())
        .await
        .unwrap();
    assert!(fixture.stored_keys().await.is_empty());
}

#[tokio::test]
async fn missing_paths() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    assert!(conn.list(&p("/"), false).await.unwrap().is_empty());
    assert!(is_not_found(&conn.list(&p("/nope"), false).await.unwrap_err()));
    assert!(conn.safe_list(&p("/nope"), true).await.unwrap().is_empty());
    assert!(conn.safe_metadata(&p("/nope")).await.unwrap().is_none());
    assert!(conn.safe_read_file(&p("/nope")).await.unwrap().is_none());
    assert!(is_not_found(
        &conn
            .remove(&p("/nope"), RemoveOptions::default())
            .await
            .unwrap_err()
    ));
    let quiet = RemoveOptions {
        recursive: true,
        quiet: true,
    };
    assert!(conn.remove(&p("/nope"), quiet).await.unwrap().is_empty());
}

#[tokio::test]
async fn non_recursive_remove_keeps_children() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    conn.write_file(&p("/d/f"), "1").await.unwrap();
    conn.remove(&p("/d"), RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(names(&conn.list(&p("/d"), false).await.unwrap()), ["/d/f"]);
}

#[tokio::test]
async fn non_recursive_remove_of_file_with_children() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    conn.write_file(&p("/a"), "file").await.unwrap();
    conn.write_file(&p("/a/b"), "child").await.unwrap();
    let meta = conn.metadata(&p("/a")).await.unwrap();
    assert_eq!((meta.kind, meta.size), (EntryKind::File, Some(4)));

    let removed = conn.remove(&p("/a"), RemoveOptions::default()).await.unwrap();
    assert_eq!(removed, ["/a"]);

    assert!(conn.metadata(&p("/a")).await.unwrap().is_dir());
    let root = conn.list(&p("/"), false).await.unwrap();
    assert_eq!(names(&root), ["/a"]);
    assert!(root[0].is_dir());
    assert_eq!(names(&conn.list(&p("/a"), false).await.unwrap()), ["/a/b"]);
    assert!(is_not_found(&conn.read_file(&p("/a")).await.unwrap_err()));
    assert_eq!(conn.read_file(&p("/a/b")).await.unwrap().as_ref(), b"child");

    // Without content of its own, the directory is not removed.
    conn.remove(&p("/a"), RemoveOptions::default())
        .await
        .unwrap_err();
}

#[tokio::test]
async fn metadata_is_cached_until_expiry_or_flush() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(CountingBackend {
        inner: LocalBackend::new(dir.path().join("storage")),
        metadata_calls: AtomicUsize::new(0),
    });
    let options = ConnectOptions {
        identity: dir.path().display().to_string(),
        encryption: Some(EncryptionSettings::new(KEY)),
        cache: CacheSettings {
            ttl: Some(Duration::from_millis(300)),
            invalidate_on_write: false,
            ..CacheSettings::default()
        },
        ..ConnectOptions::default()
    };
    let conn = Connection::open(backend.clone(), options).await.unwrap();
    conn.write_file(&p("/f"), "content").await.unwrap();
    let calls = || backend.metadata_calls.load(Ordering::SeqCst);

    let before = calls();
    assert_eq!(conn.metadata(&p("/f")).await.unwrap().size, Some(7));
    assert_eq!(calls(), before + 1);
    conn.metadata(&p("/f")).await.unwrap();
    assert_eq!(calls(), before + 1);

    sleep(Duration::from_millis(400)).await;
    conn.metadata(&p("/f")).await.unwrap();
    assert_eq!(calls(), before + 2);

    conn.flush().await;
    conn.metadata(&p("/f")).await.unwrap();
    assert_eq!(calls(), before + 3);
}

#[tokio::test]
async fn missing_metadata_is_cached() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(CountingBackend {
        inner: LocalBackend::new(dir.path().join("storage")),
        metadata_calls: AtomicUsize::new(0),
    });
    let options = ConnectOptions {
        identity: dir.path().display().to_string(),
        encryption: Some(EncryptionSettings::new(KEY)),
        ..ConnectOptions::default()
    };
    let conn = Connection::open(backend.clone(), options).await.unwrap();
    assert!(conn.safe_metadata(&p("/ghost")).await.unwrap().is_none());
    let calls = backend.metadata_calls.load(Ordering::SeqCst);
    assert!(conn.safe_metadata(&p("/ghost")).await.unwrap().is_none());
    assert_eq!(backend.metadata_calls.load(Ordering::SeqCst), calls);

    // Writes invalidate the cache by default.
    conn.write_file(&p("/ghost"), "boo").await.unwrap();
    assert!(conn.safe_metadata(&p("/ghost")).await.unwrap().is_some());
}

#[tokio::test]
async fn other_key_sees_nothing() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    conn.write_file(&p("/secret"), "data").await.unwrap();
    let other = Connection::open(
        fixture.backend.clone(),
        fixture.options(Some("another sufficiently long key")),
    )
    .await
    .unwrap();
    assert!(other.list(&p("/"), false).await.unwrap().is_empty());
    assert!(other.safe_metadata(&p("/secret")).await.unwrap().is_none());
}

#[tokio::test]
async fn short_key_is_rejected() {
    let fixture = Fixture::new();
    Connection::open(fixture.backend.clone(), fixture.options(Some("short")))
        .await
        .err()
        .unwrap();
}

#[tokio::test]
async fn plain_connection_uses_paths_as_keys() {
    let fixture = Fixture::new();
    let conn = Connection::open(fixture.backend.clone(), fixture.options(None))
        .await
        .unwrap();
    assert!(!conn.is_encrypted());
    conn.write_file(&p("/p/q.txt"), "plain").await.unwrap();
    assert_eq!(fixture.stored_keys().await, ["p/q.txt"]);
    assert_eq!(names(&conn.list(&p("/p"), false).await.unwrap()), ["/p/q.txt"]);
    assert_eq!(conn.metadata(&p("/p/q.txt")).await.unwrap().size, Some(5));
    assert_eq!(conn.read_file(&p("/p/q.txt")).await.unwrap().as_ref(), b"plain");
}

#[tokio::test]
async fn read_only_connection_rejects_changes() {
    let fixture = Fixture::new();
    let mut options = fixture.options(Some(KEY));
    options.read_only = true;
    let conn = Connection::open(fixture.backend.clone(), options)
        .await
        .unwrap();
    conn.write_file(&p("/f"), "x").await.unwrap_err();
    conn.remove(&p("/f"), RemoveOptions::default())
        .await
        .unwrap_err();
    assert!(fixture.stored_keys().await.is_empty());
}

struct Collector(Vec<String>);

#[async_trait]
impl Visitor for Collector {
    async fn visit(&mut self, entry: &Metadata) -> Result<()> {
        self.0.push(entry.name.clone());
        Ok(())
    }
}

#[tokio::test]
async fn visitor_sees_every_entry() {
    let fixture = Fixture::new();
    let conn = fixture.connect().await;
    for path in ["/v/1", "/v/w/2"] {
        conn.write_file(&p(path), "x").await.unwrap();
    }
    let mut collector = Collector(Vec::new());
    let listed = conn
        .list_with_visitor(&p("/v"), true, &mut collector)
        .await
        .unwrap();
    assert_eq!(collector.0, names(&listed));
    assert_eq!(collector.0.len(), 3);
}

#[tokio::test]
async fn mirror_copies_and_skips() {
    let source_fixture = Fixture::new();
    let dest_fixture = Fixture::new();
    let source = source_fixture.connect().await;
    let dest = Connection::open(dest_fixture.backend.clone(), dest_fixture.options(None))
        .await
        .unwrap();
    for path in ["/src/a", "/src/sub/b", "/other"] {
        conn_write(&source, path).await;
    }

    let results = dest.mirror(&source, &p("/copy"), &p("/src")).await.unwrap();
    assert_eq!(results.success, 2);
    assert_eq!(results.errors, 0);
    assert_eq!(
        dest.read_file(&p("/copy/sub/b")).await.unwrap().as_ref(),
        b"/src/sub/b"
    );

    let again = dest.mirror(&source, &p("/copy"), &p("/src")).await.unwrap();
    assert_eq!(again.success, 0);
    assert_eq!(again.skipped, 2);
}

async fn conn_write(conn: &Connection, path: &str) {
    conn.write_file(&p(path), path.to_owned()).await.unwrap();
}
