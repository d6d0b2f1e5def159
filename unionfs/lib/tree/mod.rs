//! The filesystem tree served to a kernel adapter.
//!
//! [`UnionFs`] owns the immutable flattened view of the image plus the live
//! writable layer, and hands out per-path nodes. Nodes are created lazily on
//! lookup and stay stable (same instance, same inode number) for the life of
//! the mount.

mod dir;
mod file;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use getset::{CopyGetters, Getters};
use tokio::sync::{Mutex, RwLock};

use crate::{path, Attr, Entry, EntryKind, UnionFsError, UnionFsResult, WritableLayer};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use dir::*;
pub use file::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for building a [`UnionFs`].
#[derive(Debug, Default)]
pub struct UnionFsOptions {
    extra_dirs: Vec<String>,
    writable_dir: Option<std::path::PathBuf>,
}

/// The root of a mounted image: the flattened read-only view, the optional
/// writable layer, and the node and handle tables shared by every node.
#[derive(Debug)]
pub struct UnionFs {
    /// Every entry of the flattened view, keyed by cleaned path.
    ro_files: HashMap<String, Arc<Entry>>,

    /// Directories of the read-only view, explicit or implied by a
    /// descendant; always contains the root.
    ro_dirs: HashSet<String>,

    /// Directories requested at mount time regardless of image content.
    extra_dirs: HashSet<String>,

    writable: Option<WritableLayer>,

    /// Stable node per path for the life of the mount.
    nodes: RwLock<HashMap<String, Node>>,

    /// Open file handles.
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,

    /// Per-parent-directory locks: create/mkdir/unlink serialise against
    /// each other on the same parent, mutations on different directories
    /// proceed in parallel.
    dir_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    next_ino: AtomicU64,
    next_handle: AtomicU64,
}

/// A node of the tree. Special files (char, block, fifo) and hardlinks
/// materialise as [`FileNode`]s.
#[derive(Debug, Clone)]
pub enum Node {
    /// A directory
    Dir(Arc<DirNode>),

    /// A regular or special file
    File(Arc<FileNode>),

    /// A symbolic link
    Symlink(Arc<SymlinkNode>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Dir,
    File,
    Symlink,
}

/// A symbolic link node carrying its target in memory.
#[derive(Debug, Getters, CopyGetters)]
pub struct SymlinkNode {
    /// Path of the link inside the union namespace
    #[getset(get = "pub with_prefix")]
    path: String,

    /// Inode number, stable for the life of the mount
    #[getset(get_copy = "pub with_prefix")]
    ino: u64,

    entry: Entry,
}

/// One name returned by [`DirNode::readdir`].
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct DirEntry {
    /// Base name of the child
    #[getset(get = "pub with_prefix")]
    name: String,

    /// Kind the child will present on lookup
    #[getset(get_copy = "pub with_prefix")]
    kind: EntryKind,

    /// Full mode (type and permission bits)
    #[getset(get_copy = "pub with_prefix")]
    mode: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnionFsOptions {
    /// Directories to present even when the image carries no content for
    /// them.
    pub fn with_extra_dirs(mut self, dirs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Enables the writable overlay, rooted at `dir`.
    pub fn with_writable_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.writable_dir = Some(dir.into());
        self
    }
}

impl UnionFs {
    /// Builds the tree from a flattened (whiteout-free, name-sorted) entry
    /// list, opening the writable layer when one is configured.
    pub async fn init(
        files: Vec<Arc<Entry>>,
        options: UnionFsOptions,
    ) -> UnionFsResult<Arc<Self>> {
        let mut ro_files = HashMap::with_capacity(files.len());
        let mut ro_dirs = HashSet::new();
        ro_dirs.insert(String::new());

        for entry in files {
            let name = entry.get_name().clone();
            if entry.is_dir() {
                ro_dirs.insert(name.clone());
            }
            let mut ancestor = path::parent(&name);
            while !ancestor.is_empty() {
                if !ro_dirs.insert(ancestor.to_string()) {
                    break;
                }
                ancestor = path::parent(ancestor);
            }
            ro_files.insert(name, entry);
        }

        let mut extra_dirs = HashSet::new();
        for dir in &options.extra_dirs {
            let cleaned = path::clean(dir);
            let mut current = cleaned.as_str();
            while !current.is_empty() {
                if !extra_dirs.insert(current.to_string()) {
                    break;
                }
                current = path::parent(current);
            }
        }

        let writable = match options.writable_dir {
            Some(dir) => {
                let layer = WritableLayer::open(dir).await?;
                if layer.get("").await.is_none() {
                    layer.put(Entry::new("", EntryKind::Directory)).await?;
                }
                Some(layer)
            }
            None => None,
        };

        Ok(Arc::new(Self {
            ro_files,
            ro_dirs,
            extra_dirs,
            writable,
            nodes: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            dir_locks: Mutex::new(HashMap::new()),
            next_ino: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
        }))
    }

    /// Returns the root directory node.
    pub async fn root(self: &Arc<Self>) -> Arc<DirNode> {
        self.dir_node("").await
    }

    /// Returns the writable layer, if this mount has one.
    pub fn writable(&self) -> Option<&WritableLayer> {
        self.writable.as_ref()
    }

    /// Returns whether this mount has a writable layer.
    pub fn is_writable(&self) -> bool {
        self.writable.is_some()
    }

    /// Persists the writable layer's metadata; a no-op on read-only mounts.
    pub async fn persist_writable(&self) -> UnionFsResult<()> {
        match &self.writable {
            Some(layer) => layer.persist().await,
            None => Ok(()),
        }
    }

    pub(crate) fn ro_files(&self) -> &HashMap<String, Arc<Entry>> {
        &self.ro_files
    }

    pub(crate) fn ro_dirs(&self) -> &HashSet<String> {
        &self.ro_dirs
    }

    pub(crate) fn extra_dirs(&self) -> &HashSet<String> {
        &self.extra_dirs
    }

    /// Returns the mutation lock for one directory, creating it on first
    /// use.
    pub(crate) async fn dir_lock(&self, dir_path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dir_locks.lock().await;
        Arc::clone(
            locks
                .entry(dir_path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the stable node for `node_path`, creating it when absent or
    /// when the cached node's variant no longer matches the path's kind.
    async fn get_or_insert<F>(self: &Arc<Self>, node_path: &str, want: NodeKind, make: F) -> Node
    where
        F: FnOnce(u64, Weak<UnionFs>) -> Node,
    {
        {
            let nodes = self.nodes.read().await;
            if let Some(node) = nodes.get(node_path) {
                if node.kind() == want {
                    return node.clone();
                }
            }
        }

        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get(node_path) {
            if node.kind() == want {
                return node.clone();
            }
        }
        let node = make(self.alloc_ino(), Arc::downgrade(self));
        nodes.insert(node_path.to_string(), node.clone());
        node
    }

    pub(crate) async fn dir_node(self: &Arc<Self>, node_path: &str) -> Arc<DirNode> {
        let node = self
            .get_or_insert(node_path, NodeKind::Dir, |ino, fs| {
                Node::Dir(Arc::new(DirNode::new(node_path.to_string(), ino, fs)))
            })
            .await;
        match node {
            Node::Dir(dir) => dir,
            _ => unreachable!("get_or_insert returned a non-directory for a directory request"),
        }
    }

    /// Materialises the node for an entry, resolving hardlinks and degrading
    /// special files to content-less file nodes. Returns `None` when a
    /// hardlink's target is absent from the union view.
    pub(crate) async fn node_from_entry(
        self: &Arc<Self>,
        node_path: &str,
        entry: Arc<Entry>,
        is_writable: bool,
    ) -> Option<Node> {
        match entry.get_kind() {
            EntryKind::Directory => Some(Node::Dir(self.dir_node(node_path).await)),
            EntryKind::Symlink => Some(
                self.get_or_insert(node_path, NodeKind::Symlink, |ino, _| {
                    Node::Symlink(Arc::new(SymlinkNode {
                        path: node_path.to_string(),
                        ino,
                        entry: entry.as_ref().clone(),
                    }))
                })
                .await,
            ),
            EntryKind::Hardlink => {
                let resolved = Arc::new(self.resolve_hardlink(&entry)?);
                let node = self
                    .get_or_insert(node_path, NodeKind::File, |ino, fs| {
                        Node::File(Arc::new(FileNode::new(
                            node_path.to_string(),
                            ino,
                            resolved,
                            fs,
                        )))
                    })
                    .await;
                if let Node::File(file) = &node {
                    file.set_writable(is_writable);
                }
                Some(node)
            }
            _ => {
                let node = self
                    .get_or_insert(node_path, NodeKind::File, |ino, fs| {
                        Node::File(Arc::new(FileNode::new(node_path.to_string(), ino, entry, fs)))
                    })
                    .await;
                if let Node::File(file) = &node {
                    file.set_writable(is_writable);
                }
                Some(node)
            }
        }
    }

    /// Resolves a hardlink against the union view, yielding a regular entry
    /// sharing the target's blob and size.
    pub(crate) fn resolve_hardlink(&self, entry: &Entry) -> Option<Entry> {
        let target = path::clean(entry.get_link_name().as_deref().unwrap_or(""));
        match self.ro_files.get(&target) {
            Some(target_entry) if !target_entry.is_dir() => {
                let mut resolved = entry.clone();
                resolved.set_kind(EntryKind::Regular);
                resolved.set_size(target_entry.get_size());
                resolved.set_blob_path(target_entry.get_blob_path().clone());
                Some(resolved)
            }
            _ => {
                tracing::warn!(
                    path = %entry.get_name(),
                    target = %target,
                    "dropping hardlink with unresolved target"
                );
                None
            }
        }
    }

    pub(crate) async fn invalidate_node(&self, node_path: &str) {
        self.nodes.write().await.remove(node_path);
    }

    pub(crate) async fn register_handle(&self, handle: FileHandle) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.write().await.insert(id, Arc::new(handle));
        id
    }

    pub(crate) async fn handle(&self, id: u64) -> UnionFsResult<Arc<FileHandle>> {
        self.handles
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(UnionFsError::BadHandle(id))
    }

    pub(crate) async fn remove_handle(&self, id: u64) -> UnionFsResult<Arc<FileHandle>> {
        self.handles
            .write()
            .await
            .remove(&id)
            .ok_or(UnionFsError::BadHandle(id))
    }
}

impl Node {
    /// Returns the node's inode number.
    pub fn ino(&self) -> u64 {
        match self {
            Node::Dir(node) => node.get_ino(),
            Node::File(node) => node.get_ino(),
            Node::Symlink(node) => node.get_ino(),
        }
    }

    /// Returns the node's reported attributes.
    pub async fn attr(&self) -> UnionFsResult<Attr> {
        match self {
            Node::Dir(node) => node.getattr().await,
            Node::File(node) => node.getattr().await,
            Node::Symlink(node) => Ok(node.getattr()),
        }
    }

    /// Returns the directory node, or `None` for files and symlinks.
    pub fn as_dir(&self) -> Option<&Arc<DirNode>> {
        match self {
            Node::Dir(node) => Some(node),
            _ => None,
        }
    }

    /// Returns the file node, or `None` for directories and symlinks.
    pub fn as_file(&self) -> Option<&Arc<FileNode>> {
        match self {
            Node::File(node) => Some(node),
            _ => None,
        }
    }

    /// Returns the symlink node, or `None` otherwise.
    pub fn as_symlink(&self) -> Option<&Arc<SymlinkNode>> {
        match self {
            Node::Symlink(node) => Some(node),
            _ => None,
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            Node::Dir(_) => NodeKind::Dir,
            Node::File(_) => NodeKind::File,
            Node::Symlink(_) => NodeKind::Symlink,
        }
    }
}

impl SymlinkNode {
    /// Returns the link's target path.
    pub fn readlink(&self) -> String {
        self.entry.get_link_name().clone().unwrap_or_default()
    }

    /// Returns the link's attributes.
    pub fn getattr(&self) -> Attr {
        Attr::from_entry(self.ino, &self.entry)
    }
}

impl DirEntry {
    pub(crate) fn from_entry(entry: &Entry) -> Self {
        let kind = match entry.get_kind() {
            EntryKind::Hardlink => EntryKind::Regular,
            kind => kind,
        };
        Self {
            name: path::file_name(entry.get_name()).to_string(),
            kind,
            mode: kind.type_bits() | (entry.get_mode() & 0o7777),
        }
    }

    pub(crate) fn implicit_dir(name: String) -> Self {
        Self {
            name,
            kind: EntryKind::Directory,
            mode: EntryKind::Directory.type_bits() | 0o755,
        }
    }
}
