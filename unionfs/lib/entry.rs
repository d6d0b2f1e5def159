use std::path::PathBuf;

use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters, Setters};
use nix::{
    sys::stat::SFlag,
    unistd::{getgid, getuid},
};
use serde::{Deserialize, Serialize};

use crate::path;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix marking a whiteout record in a layer or writable overlay.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The basename marking a directory whose lower-layer contents are hidden.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of a filesystem object recorded in a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file backed by a content-addressed blob
    Regular,

    /// Directory
    Directory,

    /// Symbolic link carrying its target in `linkname`
    Symlink,

    /// Hard link resolved against the union view at materialisation time
    Hardlink,

    /// Character device (no backing content)
    Char,

    /// Block device (no backing content)
    Block,

    /// Named pipe (no backing content)
    Fifo,
}

/// The metadata record for a single filesystem object in a layer or in the
/// writable overlay.
///
/// This is the tar-header equivalent that layers persist in their `.meta`
/// files and the writable layer persists in `metadata.json`. Regular entries
/// carry a `blob_path` into the blob store; links carry a `linkname`; special
/// files carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, CopyGetters, Setters)]
pub struct Entry {
    /// Path of the object inside the union namespace
    #[getset(get = "pub with_prefix", set = "pub with_prefix")]
    name: String,

    /// Object kind
    #[serde(rename = "type")]
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    kind: EntryKind,

    /// Permission bits
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    mode: u32,

    /// Owning user id
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    uid: u32,

    /// Owning group id
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    gid: u32,

    /// Size in bytes as recorded by the layer header
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    size: u64,

    /// Last access time
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    atime: DateTime<Utc>,

    /// Last modification time
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    mtime: DateTime<Utc>,

    /// Last status change time
    #[getset(get_copy = "pub with_prefix", set = "pub with_prefix")]
    ctime: DateTime<Utc>,

    /// Link target for symlinks and hardlinks
    #[serde(rename = "linkname", skip_serializing_if = "Option::is_none", default)]
    #[getset(get = "pub with_prefix", set = "pub with_prefix")]
    link_name: Option<String>,

    /// Location of the content blob for regular files
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[getset(get = "pub with_prefix", set = "pub with_prefix")]
    blob_path: Option<PathBuf>,
}

/// The attributes a kernel adapter reports for a node (`stat` shape).
#[derive(Debug, Clone, PartialEq, CopyGetters, Getters)]
pub struct Attr {
    /// Stable inode number for the life of the mount
    #[getset(get_copy = "pub with_prefix")]
    ino: u64,

    /// Object kind
    #[getset(get_copy = "pub with_prefix")]
    kind: EntryKind,

    /// Full mode: type bits combined with permission bits
    #[getset(get_copy = "pub with_prefix")]
    mode: u32,

    /// Size in bytes
    #[getset(get_copy = "pub with_prefix")]
    size: u64,

    /// Owning user id
    #[getset(get_copy = "pub with_prefix")]
    uid: u32,

    /// Owning group id
    #[getset(get_copy = "pub with_prefix")]
    gid: u32,

    /// Last access time
    #[getset(get_copy = "pub with_prefix")]
    atime: DateTime<Utc>,

    /// Last modification time
    #[getset(get_copy = "pub with_prefix")]
    mtime: DateTime<Utc>,

    /// Last status change time
    #[getset(get_copy = "pub with_prefix")]
    ctime: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EntryKind {
    /// Returns the `S_IFMT` type bits for this kind.
    pub fn type_bits(&self) -> u32 {
        let flag = match self {
            EntryKind::Regular | EntryKind::Hardlink => SFlag::S_IFREG,
            EntryKind::Directory => SFlag::S_IFDIR,
            EntryKind::Symlink => SFlag::S_IFLNK,
            EntryKind::Char => SFlag::S_IFCHR,
            EntryKind::Block => SFlag::S_IFBLK,
            EntryKind::Fifo => SFlag::S_IFIFO,
        };
        flag.bits() as u32
    }
}

impl Entry {
    /// Creates an entry with default permissions for its kind (0644 for
    /// files, 0755 for directories, 0777 for symlinks), current ownership and
    /// the current time on all three timestamps.
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        let now = Utc::now();
        let mode = match kind {
            EntryKind::Directory => 0o755,
            EntryKind::Symlink => 0o777,
            _ => 0o644,
        };
        Self {
            name: name.into(),
            kind,
            mode,
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            link_name: None,
            blob_path: None,
        }
    }

    /// Creates the whiteout record shadowing `path` in lower layers.
    pub fn tombstone(path: &str) -> Self {
        let name = path::join(path::parent(path), &whiteout_name(path::file_name(path)));
        let mut entry = Self::new(name, EntryKind::Regular);
        entry.set_mode(0);
        entry
    }

    /// Returns whether this entry records a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Returns whether this entry's basename is a whiteout marker.
    pub fn is_whiteout(&self) -> bool {
        path::file_name(&self.name).starts_with(WHITEOUT_PREFIX)
    }
}

impl Attr {
    /// Builds the reported attributes for a node from its metadata record.
    pub fn from_entry(ino: u64, entry: &Entry) -> Self {
        Self {
            ino,
            kind: entry.get_kind(),
            mode: entry.get_kind().type_bits() | (entry.get_mode() & 0o7777),
            size: entry.get_size(),
            uid: entry.get_uid(),
            gid: entry.get_gid(),
            atime: entry.get_atime(),
            mtime: entry.get_mtime(),
            ctime: entry.get_ctime(),
        }
    }

    /// Attributes for a directory that exists only implicitly (an ancestor of
    /// some entry, or an extra directory requested at mount time).
    pub fn implicit_dir(ino: u64) -> Self {
        Self {
            ino,
            kind: EntryKind::Directory,
            mode: SFlag::S_IFDIR.bits() as u32 | 0o755,
            size: 0,
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            atime: DateTime::UNIX_EPOCH,
            mtime: DateTime::UNIX_EPOCH,
            ctime: DateTime::UNIX_EPOCH,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the whiteout basename shadowing `name`.
pub fn whiteout_name(name: &str) -> String {
    format!("{}{}", WHITEOUT_PREFIX, name)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
