use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use getset::{CopyGetters, Getters};
use nix::fcntl::OFlag;
use tokio::fs::OpenOptions;

use crate::{
    path, whiteout_name, Attr, DirEntry, Entry, EntryKind, FileHandle, Node, UnionFs, UnionFsError,
    UnionFsResult, WHITEOUT_PREFIX,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A directory of the union view.
///
/// Lookups follow a fixed precedence: the writable layer wins, then its
/// tombstones, then the read-only entries, then implicit read-only
/// directories, then extra directories requested at mount time.
#[derive(Debug, Getters, CopyGetters)]
pub struct DirNode {
    /// Path of the directory inside the union namespace (`""` for the root)
    #[getset(get = "pub with_prefix")]
    path: String,

    /// Inode number, stable for the life of the mount
    #[getset(get_copy = "pub with_prefix")]
    ino: u64,

    fs: Weak<UnionFs>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirNode {
    pub(crate) fn new(path: String, ino: u64, fs: Weak<UnionFs>) -> Self {
        Self { path, ino, fs }
    }

    fn fs(&self) -> UnionFsResult<Arc<UnionFs>> {
        self.fs.upgrade().ok_or(UnionFsError::Detached)
    }

    /// Resolves a child by name.
    pub async fn lookup(&self, name: &str) -> UnionFsResult<Node> {
        let fs = self.fs()?;
        let child_path = path::join(&self.path, name);

        // Precedence 1 and 2: the writable layer and its tombstones.
        if let Some(layer) = fs.writable() {
            if let Some(entry) = layer.get(&child_path).await {
                return fs
                    .node_from_entry(&child_path, Arc::new(entry), true)
                    .await
                    .ok_or(UnionFsError::NotFound(child_path));
            }
            let tombstone = path::join(&self.path, &whiteout_name(name));
            if layer.get(&tombstone).await.is_some() {
                return Err(UnionFsError::NotFound(child_path));
            }
        }

        // Precedence 3: read-only entries.
        if let Some(entry) = fs.ro_files().get(&child_path) {
            return fs
                .node_from_entry(&child_path, Arc::clone(entry), false)
                .await
                .ok_or(UnionFsError::NotFound(child_path));
        }

        // Precedence 4 and 5: implicit and extra directories.
        if fs.ro_dirs().contains(&child_path) || fs.extra_dirs().contains(&child_path) {
            return Ok(Node::Dir(fs.dir_node(&child_path).await));
        }

        Err(UnionFsError::NotFound(child_path))
    }

    /// Lists the directory: read-only children merged with the writable
    /// layer's, where writable entries override and tombstones remove.
    pub async fn readdir(&self) -> UnionFsResult<Vec<DirEntry>> {
        let fs = self.fs()?;
        let mut merged: BTreeMap<String, DirEntry> = BTreeMap::new();

        for (child_path, entry) in fs.ro_files() {
            if !path::is_direct_child(&self.path, child_path) {
                continue;
            }
            if entry.get_kind() == EntryKind::Hardlink && fs.resolve_hardlink(entry).is_none() {
                continue;
            }
            merged.insert(
                path::file_name(child_path).to_string(),
                DirEntry::from_entry(entry),
            );
        }

        for dir_path in fs.ro_dirs().iter().chain(fs.extra_dirs().iter()) {
            if path::is_direct_child(&self.path, dir_path) {
                let name = path::file_name(dir_path).to_string();
                merged
                    .entry(name.clone())
                    .or_insert_with(|| DirEntry::implicit_dir(name));
            }
        }

        if let Some(layer) = fs.writable() {
            for entry in layer.list_children(&self.path).await {
                let base = path::file_name(entry.get_name()).to_string();
                match base.strip_prefix(WHITEOUT_PREFIX) {
                    Some(original) => {
                        merged.remove(original);
                    }
                    None => {
                        merged.insert(base, DirEntry::from_entry(&entry));
                    }
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    /// Creates a subdirectory in the writable layer.
    pub async fn mkdir(&self, name: &str, mode: u32) -> UnionFsResult<Arc<DirNode>> {
        let fs = self.fs()?;
        let Some(layer) = fs.writable() else {
            return Err(UnionFsError::ReadOnlyFilesystem);
        };
        let dir_lock = fs.dir_lock(&self.path).await;
        let _guard = dir_lock.lock().await;

        let child_path = path::join(&self.path, name);
        let mut entry = Entry::new(child_path.clone(), EntryKind::Directory);
        entry.set_mode(mode & 0o7777);
        layer.put(entry).await?;

        // a tombstone left by an earlier unlink must not shadow the new dir
        layer
            .delete(&path::join(&self.path, &whiteout_name(name)))
            .await?;

        fs.invalidate_node(&child_path).await;
        Ok(fs.dir_node(&child_path).await)
    }

    /// Creates a regular file in the writable layer and opens its content
    /// with the caller's flags, returning the node and an open handle.
    pub async fn create(&self, name: &str, flags: i32, mode: u32) -> UnionFsResult<(Node, u64)> {
        let fs = self.fs()?;
        let Some(layer) = fs.writable() else {
            return Err(UnionFsError::ReadOnlyFilesystem);
        };
        let dir_lock = fs.dir_lock(&self.path).await;
        let _guard = dir_lock.lock().await;

        let child_path = path::join(&self.path, name);
        let mut entry = Entry::new(child_path.clone(), EntryKind::Regular);
        entry.set_mode(mode & 0o7777);
        let content_path = layer.put(entry.clone()).await?;
        layer
            .delete(&path::join(&self.path, &whiteout_name(name)))
            .await?;

        let oflag = OFlag::from_bits_truncate(flags);
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if oflag.contains(OFlag::O_TRUNC) {
            options.truncate(true);
        }
        if oflag.contains(OFlag::O_APPEND) {
            options.append(true);
        }
        let file = options.open(&content_path).await?;

        fs.invalidate_node(&child_path).await;
        let node = fs
            .node_from_entry(&child_path, Arc::new(entry), true)
            .await
            .ok_or_else(|| UnionFsError::NotFound(child_path.clone()))?;
        let handle_id = fs
            .register_handle(FileHandle::new(child_path, Some(file), true))
            .await;

        Ok((node, handle_id))
    }

    /// Removes a child: a writable entry is deleted outright, a read-only
    /// entry is shadowed with a tombstone.
    pub async fn unlink(&self, name: &str) -> UnionFsResult<()> {
        let fs = self.fs()?;
        let Some(layer) = fs.writable() else {
            return Err(UnionFsError::ReadOnlyFilesystem);
        };
        let dir_lock = fs.dir_lock(&self.path).await;
        let _guard = dir_lock.lock().await;

        let child_path = path::join(&self.path, name);

        if layer.get(&child_path).await.is_some() {
            layer.delete(&child_path).await?;
            fs.invalidate_node(&child_path).await;
            return Ok(());
        }

        if fs.ro_files().contains_key(&child_path) {
            let tombstone = Entry::tombstone(&child_path);
            let content_path = layer.put(tombstone).await?;
            // touch the body so the content tree stays consistent with the
            // metadata map
            tokio::fs::File::create(&content_path).await?;
            fs.invalidate_node(&child_path).await;
            return Ok(());
        }

        Err(UnionFsError::NotFound(child_path))
    }

    /// Returns the directory's attributes: the writable record when one
    /// exists, else the read-only record, else implicit-directory defaults.
    pub async fn getattr(&self) -> UnionFsResult<Attr> {
        let fs = self.fs()?;

        if let Some(layer) = fs.writable() {
            if let Some(entry) = layer.get(&self.path).await {
                return Ok(Attr::from_entry(self.ino, &entry));
            }
        }
        if let Some(entry) = fs.ro_files().get(&self.path) {
            return Ok(Attr::from_entry(self.ino, entry));
        }

        Ok(Attr::implicit_dir(self.ino))
    }
}
