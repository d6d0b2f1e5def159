//! End-to-end tests for the union tree: flatten fabricated layers, mount
//! them with and without a writable overlay, and drive the node operations
//! the way a kernel adapter would.

use std::{path::Path, sync::Arc};

use nix::fcntl::OFlag;
use tempfile::TempDir;
use unionfs::{
    unify, Entry, EntryKind, Node, UnionFs, UnionFsError, UnionFsOptions, METADATA_FILE_NAME,
};

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

struct LayerBuilder {
    blob_dir: std::path::PathBuf,
    entries: Vec<Arc<Entry>>,
}

impl LayerBuilder {
    fn new(blob_dir: &Path) -> Self {
        Self {
            blob_dir: blob_dir.to_path_buf(),
            entries: Vec::new(),
        }
    }

    fn file(mut self, name: &str, content: &str) -> Self {
        let blob_path = self.blob_dir.join(format!("blob-{}", self.entries.len()));
        std::fs::write(&blob_path, content).unwrap();
        let mut entry = Entry::new(name, EntryKind::Regular);
        entry.set_size(content.len() as u64);
        entry.set_blob_path(Some(blob_path));
        self.entries.push(Arc::new(entry));
        self
    }

    fn dir(mut self, name: &str) -> Self {
        self.entries.push(Arc::new(Entry::new(name, EntryKind::Directory)));
        self
    }

    fn symlink(mut self, name: &str, target: &str) -> Self {
        let mut entry = Entry::new(name, EntryKind::Symlink);
        entry.set_link_name(Some(target.to_string()));
        self.entries.push(Arc::new(entry));
        self
    }

    fn hardlink(mut self, name: &str, target: &str) -> Self {
        let mut entry = Entry::new(name, EntryKind::Hardlink);
        entry.set_link_name(Some(target.to_string()));
        self.entries.push(Arc::new(entry));
        self
    }

    fn whiteout(mut self, name: &str) -> Self {
        let wh = format!(".wh.{}", name.trim_start_matches('/'));
        self.entries.push(Arc::new(Entry::new(wh, EntryKind::Regular)));
        self
    }

    fn build(self) -> Vec<Arc<Entry>> {
        self.entries
    }
}

async fn mount(layers: &[Vec<Arc<Entry>>], options: UnionFsOptions) -> Arc<UnionFs> {
    let slices: Vec<&[Arc<Entry>]> = layers.iter().map(|l| l.as_slice()).collect();
    UnionFs::init(unify(&slices), options).await.unwrap()
}

async fn read_all(fs: &Arc<UnionFs>, path: &str) -> Vec<u8> {
    let root = fs.root().await;
    let mut node = Node::Dir(root);
    for part in path.split('/') {
        node = node.as_dir().unwrap().lookup(part).await.unwrap();
    }
    let file = node.as_file().unwrap();
    let fh = file.open(OFlag::O_RDONLY.bits()).await.unwrap();
    let data = file.read(fh, 0, 1 << 16).await.unwrap();
    file.release(fh).await.unwrap();
    data
}

async fn readdir_names(fs: &Arc<UnionFs>, path: &str) -> Vec<String> {
    let root = fs.root().await;
    let dir = if path.is_empty() {
        root
    } else {
        let mut node = Node::Dir(root);
        for part in path.split('/') {
            node = node.as_dir().unwrap().lookup(part).await.unwrap();
        }
        node.as_dir().unwrap().clone()
    };
    dir.readdir()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.get_name().clone())
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_single_layer_read() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/hello.txt", "world").build();

    let fs = mount(&[layer], UnionFsOptions::default()).await;
    assert_eq!(readdir_names(&fs, "").await, ["hello.txt"]);
    assert_eq!(read_all(&fs, "hello.txt").await, b"world");
}

#[tokio::test]
async fn test_top_layer_overrides_and_reads_top_bytes() {
    let tmp = TempDir::new().unwrap();
    let base = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/cfg", "v1")
        .build();
    let top = LayerBuilder::new(tmp.path()).file("/app/cfg", "v2").build();

    let fs = mount(&[base, top], UnionFsOptions::default()).await;
    assert_eq!(readdir_names(&fs, "app").await, ["cfg"]);
    assert_eq!(read_all(&fs, "app/cfg").await, b"v2");
}

#[tokio::test]
async fn test_whiteout_hides_directory() {
    let tmp = TempDir::new().unwrap();
    let base = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/main", "x")
        .build();
    let top = LayerBuilder::new(tmp.path()).whiteout("app").build();

    let fs = mount(&[base, top], UnionFsOptions::default()).await;
    assert!(readdir_names(&fs, "").await.is_empty());

    let root = fs.root().await;
    assert!(matches!(
        root.lookup("app").await,
        Err(UnionFsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_opaque_marker_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let base = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/a", "1")
        .file("/app/b", "2")
        .build();
    let top = LayerBuilder::new(tmp.path())
        .file("/app/.wh..wh..opq", "")
        .file("/app/new", "3")
        .build();

    let fs = mount(&[base, top], UnionFsOptions::default()).await;
    assert_eq!(readdir_names(&fs, "app").await, ["new"]);

    let root = fs.root().await;
    let app = root.lookup("app").await.unwrap();
    assert!(matches!(
        app.as_dir().unwrap().lookup("a").await,
        Err(UnionFsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_readdir_types_agree_with_lookup() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path())
        .dir("/etc")
        .file("/etc/host", "base")
        .symlink("/etc/alias", "host")
        .build();

    let fs = mount(&[layer], UnionFsOptions::default()).await;
    let root = fs.root().await;
    let etc = root.lookup("etc").await.unwrap();
    let etc = etc.as_dir().unwrap();

    for dirent in etc.readdir().await.unwrap() {
        let node = etc.lookup(dirent.get_name()).await.unwrap();
        match dirent.get_kind() {
            EntryKind::Directory => assert!(node.as_dir().is_some()),
            EntryKind::Symlink => assert!(node.as_symlink().is_some()),
            _ => assert!(node.as_file().is_some()),
        }
    }

    let alias = etc.lookup("alias").await.unwrap();
    assert_eq!(alias.as_symlink().unwrap().readlink(), "host");
}

#[tokio::test]
async fn test_hardlink_shares_target_content() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path())
        .file("/data", "shared")
        .hardlink("/link", "/data")
        .hardlink("/dangling", "/nowhere")
        .build();

    let fs = mount(&[layer], UnionFsOptions::default()).await;
    assert_eq!(read_all(&fs, "link").await, b"shared");

    // the dangling link is dropped from listings and lookups
    assert_eq!(readdir_names(&fs, "").await, ["data", "link"]);
    let root = fs.root().await;
    assert!(root.lookup("dangling").await.is_err());
}

#[tokio::test]
async fn test_lookup_returns_stable_nodes() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/cfg", "v1")
        .build();

    let fs = mount(&[layer], UnionFsOptions::default()).await;
    let root = fs.root().await;
    let first = root.lookup("app").await.unwrap();
    let second = root.lookup("app").await.unwrap();
    assert_eq!(first.ino(), second.ino());

    let cfg_a = first.as_dir().unwrap().lookup("cfg").await.unwrap();
    let cfg_b = second.as_dir().unwrap().lookup("cfg").await.unwrap();
    assert_eq!(cfg_a.ino(), cfg_b.ino());
    assert_ne!(cfg_a.ino(), first.ino());
}

#[tokio::test]
async fn test_extra_dirs_are_visible() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/hello", "x").build();

    let fs = mount(
        &[layer],
        UnionFsOptions::default().with_extra_dirs(["var/tmp"]),
    )
    .await;
    assert_eq!(readdir_names(&fs, "").await, ["hello", "var"]);
    assert_eq!(readdir_names(&fs, "var").await, ["tmp"]);
}

#[tokio::test]
async fn test_read_only_mount_refuses_mutations() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/cfg", "v1").build();

    let fs = mount(&[layer], UnionFsOptions::default()).await;
    let root = fs.root().await;

    assert!(matches!(
        root.mkdir("new", 0o755).await,
        Err(UnionFsError::ReadOnlyFilesystem)
    ));
    assert!(matches!(
        root.create("new", OFlag::O_RDWR.bits(), 0o644).await,
        Err(UnionFsError::ReadOnlyFilesystem)
    ));
    assert!(matches!(
        root.unlink("cfg").await,
        Err(UnionFsError::ReadOnlyFilesystem)
    ));

    let cfg = root.lookup("cfg").await.unwrap();
    let file = cfg.as_file().unwrap();
    let fh = file.open(OFlag::O_RDONLY.bits()).await.unwrap();
    assert!(matches!(
        file.write(fh, 0, b"x").await,
        Err(UnionFsError::ReadOnlyFilesystem)
    ));
    file.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_empty_writable_layer_reads_like_none() {
    let tmp = TempDir::new().unwrap();
    let write_dir = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/cfg", "v1")
        .build();

    let plain = mount(&[layer.clone()], UnionFsOptions::default()).await;
    let overlaid = mount(
        &[layer],
        UnionFsOptions::default().with_writable_dir(write_dir.path()),
    )
    .await;

    assert_eq!(
        readdir_names(&plain, "app").await,
        readdir_names(&overlaid, "app").await
    );
    assert_eq!(
        read_all(&plain, "app/cfg").await,
        read_all(&overlaid, "app/cfg").await
    );
}

#[tokio::test]
async fn test_copy_on_write() {
    let tmp = TempDir::new().unwrap();
    let write_dir = TempDir::new().unwrap();
    let base = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/cfg", "v1")
        .build();
    let top = LayerBuilder::new(tmp.path()).file("/app/cfg", "v2").build();
    let blob_path = top[0].get_blob_path().clone().unwrap();

    let fs = mount(
        &[base, top],
        UnionFsOptions::default().with_writable_dir(write_dir.path()),
    )
    .await;

    let root = fs.root().await;
    let app = root.lookup("app").await.unwrap();
    let cfg = app.as_dir().unwrap().lookup("cfg").await.unwrap();
    let file = cfg.as_file().unwrap();

    let fh = file.open(OFlag::O_RDWR.bits()).await.unwrap();
    assert_eq!(file.write(fh, 0, b"v3").await.unwrap(), 2);
    assert_eq!(file.read(fh, 0, 16).await.unwrap(), b"v3");
    file.release(fh).await.unwrap();

    // a fresh lookup serves the written bytes
    assert_eq!(read_all(&fs, "app/cfg").await, b"v3");

    // the body landed under content/ and the original blob is untouched
    assert_eq!(
        std::fs::read(write_dir.path().join("content/app/cfg")).unwrap(),
        b"v3"
    );
    assert_eq!(std::fs::read(&blob_path).unwrap(), b"v2");

    // the recorded size reflects the descriptor, and attributes report it
    let attr = file.getattr().await.unwrap();
    assert_eq!(attr.get_size(), 2);

    // persisted metadata round-trips the copied-up entry
    fs.persist_writable().await.unwrap();
    let meta = std::fs::read_to_string(write_dir.path().join(METADATA_FILE_NAME)).unwrap();
    let map: std::collections::HashMap<String, Entry> = serde_json::from_str(&meta).unwrap();
    assert_eq!(map.get("app/cfg").unwrap().get_size(), 2);
}

#[tokio::test]
async fn test_write_at_offset_grows_file() {
    let tmp = TempDir::new().unwrap();
    let write_dir = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/log", "0123456789").build();

    let fs = mount(
        &[layer],
        UnionFsOptions::default().with_writable_dir(write_dir.path()),
    )
    .await;

    let root = fs.root().await;
    let log = root.lookup("log").await.unwrap();
    let file = log.as_file().unwrap();
    let fh = file.open(OFlag::O_RDWR.bits()).await.unwrap();

    file.write(fh, 8, b"abcd").await.unwrap();
    assert_eq!(file.read(fh, 0, 32).await.unwrap(), b"01234567abcd");

    // size comes from stat, not from summing write lengths
    let attr = file.getattr().await.unwrap();
    assert_eq!(attr.get_size(), 12);
    file.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_create_mkdir_unlink_round_trip() {
    let tmp = TempDir::new().unwrap();
    let write_dir = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path())
        .dir("/app")
        .file("/app/cfg", "v1")
        .build();

    let fs = mount(
        &[layer],
        UnionFsOptions::default().with_writable_dir(write_dir.path()),
    )
    .await;
    let root = fs.root().await;

    // mkdir + create inside it
    let logs = root.mkdir("logs", 0o750).await.unwrap();
    let (node, fh) = logs
        .create("app.log", (OFlag::O_RDWR | OFlag::O_CREAT).bits(), 0o640)
        .await
        .unwrap();
    let file = node.as_file().unwrap();
    file.write(fh, 0, b"started").await.unwrap();
    file.release(fh).await.unwrap();

    assert_eq!(readdir_names(&fs, "logs").await, ["app.log"]);
    assert_eq!(read_all(&fs, "logs/app.log").await, b"started");

    // unlink a writable file removes it and its content
    logs.unlink("app.log").await.unwrap();
    assert!(readdir_names(&fs, "logs").await.is_empty());
    assert!(!write_dir.path().join("content/logs/app.log").exists());

    // unlink a read-only file leaves a tombstone
    let app = root.lookup("app").await.unwrap();
    app.as_dir().unwrap().unlink("cfg").await.unwrap();
    assert!(readdir_names(&fs, "app").await.is_empty());
    assert!(matches!(
        app.as_dir().unwrap().lookup("cfg").await,
        Err(UnionFsError::NotFound(_))
    ));

    // unlinking something that never existed is ENOENT
    assert!(matches!(
        app.as_dir().unwrap().unlink("ghost").await,
        Err(UnionFsError::NotFound(_))
    ));

    // the tombstone survives persistence
    fs.persist_writable().await.unwrap();
    let meta = std::fs::read_to_string(write_dir.path().join(METADATA_FILE_NAME)).unwrap();
    assert!(meta.contains("app/.wh.cfg"));
}

#[tokio::test]
async fn test_tombstone_then_recreate() {
    let tmp = TempDir::new().unwrap();
    let write_dir = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/cfg", "old").build();

    let fs = mount(
        &[layer],
        UnionFsOptions::default().with_writable_dir(write_dir.path()),
    )
    .await;
    let root = fs.root().await;

    root.unlink("cfg").await.unwrap();
    assert!(root.lookup("cfg").await.is_err());

    let (node, fh) = root
        .create("cfg", (OFlag::O_RDWR | OFlag::O_CREAT).bits(), 0o644)
        .await
        .unwrap();
    let file = node.as_file().unwrap();
    file.write(fh, 0, b"new").await.unwrap();
    file.release(fh).await.unwrap();

    assert_eq!(read_all(&fs, "cfg").await, b"new");
    assert_eq!(readdir_names(&fs, "").await, ["cfg"]);
}

#[tokio::test]
async fn test_double_release_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/cfg", "v1").build();

    let fs = mount(&[layer], UnionFsOptions::default()).await;
    let root = fs.root().await;
    let cfg = root.lookup("cfg").await.unwrap();
    let file = cfg.as_file().unwrap();

    let fh = file.open(OFlag::O_RDONLY.bits()).await.unwrap();
    file.release(fh).await.unwrap();
    assert!(matches!(
        file.release(fh).await,
        Err(UnionFsError::BadHandle(_))
    ));
    assert!(matches!(
        file.read(fh, 0, 4).await,
        Err(UnionFsError::BadHandle(_))
    ));
}

#[tokio::test]
async fn test_racing_copy_up_converges() {
    let tmp = TempDir::new().unwrap();
    let write_dir = TempDir::new().unwrap();
    let layer = LayerBuilder::new(tmp.path()).file("/cfg", "base").build();

    let fs = mount(
        &[layer],
        UnionFsOptions::default().with_writable_dir(write_dir.path()),
    )
    .await;
    let root = fs.root().await;
    let cfg = root.lookup("cfg").await.unwrap();
    let file = Arc::clone(cfg.as_file().unwrap());

    let fh_a = file.open(OFlag::O_RDWR.bits()).await.unwrap();
    let fh_b = file.open(OFlag::O_RDWR.bits()).await.unwrap();

    let writer_a = {
        let file = Arc::clone(&file);
        tokio::spawn(async move { file.write(fh_a, 0, b"AAAA").await })
    };
    let writer_b = {
        let file = Arc::clone(&file);
        tokio::spawn(async move { file.write(fh_b, 4, b"BBBB").await })
    };
    writer_a.await.unwrap().unwrap();
    writer_b.await.unwrap().unwrap();

    // both writers landed in one writable copy
    assert_eq!(read_all(&fs, "cfg").await, b"AAAABBBB");

    file.release(fh_a).await.unwrap();
    file.release(fh_b).await.unwrap();
}
