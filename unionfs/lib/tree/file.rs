use std::{
    io::SeekFrom,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use chrono::Utc;
use getset::{CopyGetters, Getters};
use nix::fcntl::OFlag;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::{Attr, Entry, UnionFs, UnionFsError, UnionFsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A regular (or special) file of the union view.
///
/// The node remembers which side backs it: read-only nodes serve bytes
/// straight from their content blob and are copied up into the writable
/// layer on first write.
#[derive(Debug, Getters, CopyGetters)]
pub struct FileNode {
    /// Path of the file inside the union namespace
    #[getset(get = "pub with_prefix")]
    path: String,

    /// Inode number, stable for the life of the mount
    #[getset(get_copy = "pub with_prefix")]
    ino: u64,

    entry: Arc<Entry>,

    /// Whether the writable layer backs this node
    writable: AtomicBool,

    fs: Weak<UnionFs>,
}

/// An open file handle wrapping the descriptor for one `open` call.
///
/// The descriptor is single-owner: reads, writes and the copy-up descriptor
/// swap all happen under the handle's own lock, so a handle has at most one
/// writer at a time.
#[derive(Debug)]
pub struct FileHandle {
    path: String,
    state: Mutex<HandleState>,
}

#[derive(Debug)]
struct HandleState {
    /// `None` for special files without backing content.
    file: Option<File>,

    /// Whether the descriptor points at writable-layer content.
    writable: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileNode {
    pub(crate) fn new(path: String, ino: u64, entry: Arc<Entry>, fs: Weak<UnionFs>) -> Self {
        Self {
            path,
            ino,
            entry,
            writable: AtomicBool::new(false),
            fs,
        }
    }

    fn fs(&self) -> UnionFsResult<Arc<UnionFs>> {
        self.fs.upgrade().ok_or(UnionFsError::Detached)
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    /// Opens the backing content and returns a handle.
    ///
    /// Read-only backings are always opened read-only, whatever flags the
    /// caller passed: a shared blob must never be written or truncated
    /// through a descriptor. Write access materialises through copy-up on
    /// the first [`FileNode::write`] instead.
    pub async fn open(&self, flags: i32) -> UnionFsResult<u64> {
        let fs = self.fs()?;
        let oflag = OFlag::from_bits_truncate(flags);
        let wants_write = oflag.intersects(OFlag::O_WRONLY | OFlag::O_RDWR);

        let writable_backed = self.writable.load(Ordering::Acquire);
        let file = match (writable_backed, fs.writable()) {
            (true, Some(layer)) => {
                let content_path = layer.content_path(&self.path);
                let mut options = OpenOptions::new();
                options.read(true);
                if wants_write {
                    options.write(true);
                    if oflag.contains(OFlag::O_TRUNC) {
                        options.truncate(true);
                    }
                    if oflag.contains(OFlag::O_APPEND) {
                        options.append(true);
                    }
                }
                Some(options.open(&content_path).await?)
            }
            _ => match self.entry.get_blob_path() {
                Some(blob_path) => Some(OpenOptions::new().read(true).open(blob_path).await?),
                None => None,
            },
        };

        let handle = FileHandle::new(self.path.clone(), file, writable_backed);
        Ok(fs.register_handle(handle).await)
    }

    /// Positional read; EOF yields a short (possibly empty) result, never an
    /// error.
    pub async fn read(&self, handle_id: u64, offset: u64, size: usize) -> UnionFsResult<Vec<u8>> {
        let fs = self.fs()?;
        let handle = fs.handle(handle_id).await?;
        let mut state = handle.state.lock().await;

        let Some(file) = state.file.as_mut() else {
            return Ok(Vec::new());
        };

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        Ok(buf)
    }

    /// Positional write, copying the file up into the writable layer first
    /// when a read-only blob still backs it.
    pub async fn write(&self, handle_id: u64, offset: u64, data: &[u8]) -> UnionFsResult<usize> {
        let fs = self.fs()?;
        let Some(layer) = fs.writable() else {
            return Err(UnionFsError::ReadOnlyFilesystem);
        };
        let handle = fs.handle(handle_id).await?;
        let mut state = handle.state.lock().await;

        if !state.writable {
            let source = self.entry.get_blob_path().clone();
            let content_path = layer
                .copy_up(self.entry.as_ref().clone(), source.as_deref())
                .await?;

            // swap the descriptor: drop the blob-backed one, reopen the copy
            state.file.take();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&content_path)
                .await?;
            state.file = Some(file);
            state.writable = true;
            self.writable.store(true, Ordering::Release);
            tracing::debug!(path = %self.path, "copied up");
        }

        if state.file.is_none() {
            // writable special file that never had backing content
            let content_path = layer.content_path(&self.path);
            if let Some(parent) = content_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&content_path)
                .await?;
            state.file = Some(file);
        }
        let Some(file) = state.file.as_mut() else {
            return Err(UnionFsError::BadHandle(handle_id));
        };

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        // record the true size from the descriptor, not a running sum
        let len = file.metadata().await?.len();
        if let Some(mut entry) = layer.get(&self.path).await {
            entry.set_size(len);
            entry.set_mtime(Utc::now());
            layer.put(entry).await?;
        }

        Ok(data.len())
    }

    /// Closes the handle. Releasing a handle twice is an error.
    pub async fn release(&self, handle_id: u64) -> UnionFsResult<()> {
        let fs = self.fs()?;
        let handle = fs.remove_handle(handle_id).await?;
        let mut state = handle.state.lock().await;
        state.file.take();
        Ok(())
    }

    /// Returns the file's attributes; a copied-up node reports the writable
    /// layer's record.
    pub async fn getattr(&self) -> UnionFsResult<Attr> {
        let fs = self.fs()?;

        if self.writable.load(Ordering::Acquire) {
            if let Some(layer) = fs.writable() {
                if let Some(entry) = layer.get(&self.path).await {
                    return Ok(Attr::from_entry(self.ino, &entry));
                }
            }
        }

        Ok(Attr::from_entry(self.ino, &self.entry))
    }
}

impl FileHandle {
    pub(crate) fn new(path: String, file: Option<File>, writable: bool) -> Self {
        Self {
            path,
            state: Mutex::new(HandleState { file, writable }),
        }
    }

    /// Returns the union path this handle was opened for.
    pub fn path(&self) -> &str {
        &self.path
    }
}
