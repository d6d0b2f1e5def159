use std::{collections::HashMap, io, path::Path, path::PathBuf};

use tokio::{fs, sync::RwLock};

use crate::{path, Entry, EntryKind, UnionFsError, UnionFsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The metadata file persisted at the root of a writable layer directory.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// The subdirectory of a writable layer holding file bodies at their union
/// paths.
pub const CONTENT_DIR_NAME: &str = "content";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The upper, writable side of a mount.
///
/// Metadata lives in an in-memory map guarded by a readers-writer lock and is
/// persisted to `metadata.json` on unmount; file bodies live under
/// `content/` mirroring their union paths. Whiteout names (`.wh.` prefixed
/// basenames) are stored as first-class records; interpreting them as
/// tombstones is the filesystem tree's business, not this layer's.
#[derive(Debug)]
pub struct WritableLayer {
    dir: PathBuf,
    files: RwLock<HashMap<String, Entry>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WritableLayer {
    /// Opens (or initialises) a writable layer rooted at `dir`, loading any
    /// previously persisted metadata.
    pub async fn open(dir: impl Into<PathBuf>) -> UnionFsResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(CONTENT_DIR_NAME)).await?;

        let layer = Self {
            dir,
            files: RwLock::new(HashMap::new()),
        };
        layer.load().await?;

        Ok(layer)
    }

    /// Returns the on-disk location where the body of `name` belongs.
    pub fn content_path(&self, name: &str) -> PathBuf {
        self.dir.join(CONTENT_DIR_NAME).join(name)
    }

    /// Returns a copy of the record for `path`, if any.
    pub async fn get(&self, path: &str) -> Option<Entry> {
        self.files.read().await.get(path).cloned()
    }

    /// Stores a record, creating the parent directories its content will
    /// live under, and returns the content path for the body. Directories
    /// store metadata only.
    pub async fn put(&self, entry: Entry) -> UnionFsResult<PathBuf> {
        let content_path = self.content_path(entry.get_name());
        if let Some(parent) = content_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        self.files
            .write()
            .await
            .insert(entry.get_name().clone(), entry);

        Ok(content_path)
    }

    /// Materialises a read-only file into this layer, converging racing
    /// callers on a single copy: the check, the content copy and the
    /// metadata insert all happen under the write lock, so a caller that
    /// loses the race simply gets the existing content path back.
    pub async fn copy_up(&self, entry: Entry, source: Option<&Path>) -> UnionFsResult<PathBuf> {
        let content_path = self.content_path(entry.get_name());
        if let Some(parent) = content_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut files = self.files.write().await;
        if files.contains_key(entry.get_name()) {
            return Ok(content_path);
        }

        match source {
            Some(source) => {
                fs::copy(source, &content_path).await?;
            }
            None => {
                fs::File::create(&content_path).await?;
            }
        }
        files.insert(entry.get_name().clone(), entry);

        Ok(content_path)
    }

    /// Removes the record for `path` and, for regular files, its content.
    /// Silent when the record is absent.
    pub async fn delete(&self, path: &str) -> UnionFsResult<()> {
        let removed = self.files.write().await.remove(path);

        if let Some(entry) = removed {
            if entry.get_kind() == EntryKind::Regular {
                match fs::remove_file(self.content_path(path)).await {
                    Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Returns the records whose names are immediate children of `dir`.
    pub async fn list_children(&self, dir: &str) -> Vec<Entry> {
        self.files
            .read()
            .await
            .iter()
            .filter(|(name, _)| path::is_direct_child(dir, name))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Reads `metadata.json` into the in-memory map; a missing file means an
    /// empty layer.
    pub async fn load(&self) -> UnionFsResult<()> {
        let meta_path = self.dir.join(METADATA_FILE_NAME);
        let data = match fs::read(&meta_path).await {
            Result::Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let map: HashMap<String, Entry> = serde_json::from_slice(&data)
            .map_err(|err| UnionFsError::CorruptMetadata(err.to_string()))?;
        *self.files.write().await = map;

        Ok(())
    }

    /// Serialises the in-memory map to `metadata.json` atomically.
    pub async fn persist(&self) -> UnionFsResult<()> {
        let data = {
            let files = self.files.read().await;
            serde_json::to_vec_pretty(&*files)
                .map_err(|err| UnionFsError::CorruptMetadata(err.to_string()))?
        };

        let tmp_path = self.dir.join(format!("{}.tmp", METADATA_FILE_NAME));
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, self.dir.join(METADATA_FILE_NAME)).await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whiteout_name;

    #[tokio::test]
    async fn test_put_get_delete() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layer = WritableLayer::open(tmp.path()).await?;

        let mut entry = Entry::new("app/cfg", EntryKind::Regular);
        entry.set_size(2);
        let content_path = layer.put(entry).await?;
        assert_eq!(content_path, tmp.path().join("content/app/cfg"));
        assert!(content_path.parent().unwrap().exists());

        tokio::fs::write(&content_path, b"v1").await?;

        let fetched = layer.get("app/cfg").await.unwrap();
        assert_eq!(fetched.get_size(), 2);

        layer.delete("app/cfg").await?;
        assert!(layer.get("app/cfg").await.is_none());
        assert!(!content_path.exists());

        // deleting again is silent
        layer.delete("app/cfg").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_list_children_is_not_recursive() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layer = WritableLayer::open(tmp.path()).await?;

        layer.put(Entry::new("app", EntryKind::Directory)).await?;
        layer.put(Entry::new("app/cfg", EntryKind::Regular)).await?;
        layer
            .put(Entry::new("app/sub/deep", EntryKind::Regular))
            .await?;
        layer.put(Entry::new("other", EntryKind::Regular)).await?;

        let mut children: Vec<String> = layer
            .list_children("app")
            .await
            .into_iter()
            .map(|e| e.get_name().clone())
            .collect();
        children.sort();
        assert_eq!(children, ["app/cfg"]);

        let mut top: Vec<String> = layer
            .list_children("")
            .await
            .into_iter()
            .map(|e| e.get_name().clone())
            .collect();
        top.sort();
        assert_eq!(top, ["app", "other"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_persist_and_reload() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        {
            let layer = WritableLayer::open(tmp.path()).await?;
            layer.put(Entry::new("app", EntryKind::Directory)).await?;
            let mut file = Entry::new("app/cfg", EntryKind::Regular);
            file.set_size(2);
            layer.put(file).await?;
            layer
                .put(Entry::new(whiteout_name("gone"), EntryKind::Regular))
                .await?;
            layer.persist().await?;
        }

        let reloaded = WritableLayer::open(tmp.path()).await?;
        assert!(reloaded.get("app").await.unwrap().is_dir());
        assert_eq!(reloaded.get("app/cfg").await.unwrap().get_size(), 2);
        // tombstones round-trip untouched
        assert!(reloaded.get(".wh.gone").await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_an_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::write(tmp.path().join(METADATA_FILE_NAME), b"not json").await?;

        match WritableLayer::open(tmp.path()).await {
            Err(UnionFsError::CorruptMetadata(_)) => {}
            other => panic!("expected CorruptMetadata, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_up_converges_on_one_copy() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layer = WritableLayer::open(tmp.path()).await?;

        let source = tmp.path().join("blob");
        tokio::fs::write(&source, b"original").await?;

        let first = layer
            .copy_up(Entry::new("app/cfg", EntryKind::Regular), Some(&source))
            .await?;
        tokio::fs::write(&first, b"modified").await?;

        // a second copy-up must not clobber the modified content
        let second = layer
            .copy_up(Entry::new("app/cfg", EntryKind::Regular), Some(&source))
            .await?;
        assert_eq!(first, second);
        assert_eq!(tokio::fs::read(&second).await?, b"modified");
        Ok(())
    }
}
