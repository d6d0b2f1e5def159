use std::{
    ffi::OsString,
    io::Read,
    path::PathBuf,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use oci_spec::image::Digest;
use tar::EntryType;
use tempfile::NamedTempFile;
use unionfs::{Entry, EntryKind};

use crate::{utils::LAYER_META_EXTENSION, CancelToken, OcifsError, OcifsResult};

use super::BlobStore;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An unpacked layer: its digest and the ordered entry list recorded while
/// walking the layer tar.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Layer {
    /// The layer digest (of the blob as served by the registry).
    digest: Digest,

    /// Entries in tar order.
    entries: Vec<Arc<Entry>>,
}

/// Unpacks layer tars into per-file blobs plus a persisted entry list.
///
/// A layer is unpacked at most once: the `.meta` file written next to the
/// layer blob is the checkpoint, and a crash before it appears leaves only
/// content-addressed blobs that the retry reuses for free.
#[derive(Debug, Clone)]
pub struct LayerCache {
    blobs: BlobStore,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Layer {
    /// Decodes a persisted `.meta` entry list.
    pub fn from_meta(digest: Digest, data: &[u8]) -> OcifsResult<Self> {
        let entries: Vec<Entry> = serde_json::from_slice(data).map_err(|err| {
            OcifsError::CorruptStore(format!("layer {} metadata: {}", digest, err))
        })?;
        Ok(Self {
            digest,
            entries: entries.into_iter().map(Arc::new).collect(),
        })
    }
}

impl LayerCache {
    /// Creates a layer cache writing through `blobs`.
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    /// Returns the `.meta` path for a layer digest, next to its blob.
    pub fn meta_path(&self, digest: &Digest) -> PathBuf {
        let mut path: OsString = self.blobs.path_of(digest).into_os_string();
        path.push(".");
        path.push(LAYER_META_EXTENSION);
        PathBuf::from(path)
    }

    /// Returns whether the layer's entry list has been persisted.
    pub fn is_unpacked(&self, digest: &Digest) -> bool {
        self.meta_path(digest).exists()
    }

    /// Unpacks an uncompressed layer tar stream.
    ///
    /// Every record becomes an [`Entry`] carrying the tar header verbatim;
    /// regular file bodies are teed into the blob store while being hashed,
    /// and the entry points at the resulting content address. The entry
    /// list is persisted atomically once the whole stream has been
    /// consumed, so a failure part-way leaves no `.meta` and the next
    /// attempt redoes the walk against already-present blobs.
    ///
    /// Synchronous: run it on a blocking task.
    pub fn unpack(
        &self,
        reader: impl Read,
        digest: &Digest,
        cancel: &CancelToken,
    ) -> OcifsResult<()> {
        if self.is_unpacked(digest) {
            return Ok(());
        }

        let mut archive = tar::Archive::new(reader);
        let mut entries: Vec<Entry> = Vec::new();

        for record in archive.entries()? {
            cancel.check()?;
            let mut record = record?;

            let Some(mut entry) = entry_from_tar(&record)? else {
                continue;
            };

            if entry.get_kind() == EntryKind::Regular {
                let blob_digest = self.blobs.put(&mut record)?;
                entry.set_blob_path(Some(self.blobs.path_of(&blob_digest)));
            }

            entries.push(entry);
        }

        let meta_path = self.meta_path(digest);
        if let Some(parent) = meta_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = NamedTempFile::new_in(self.blobs.dir())?;
        serde_json::to_writer(&tmp, &entries)?;
        tmp.persist(&meta_path)
            .map_err(|err| OcifsError::Io(err.error))?;

        tracing::debug!(%digest, entries = entries.len(), "unpacked layer");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a tar record header onto an [`Entry`]; record types outside the
/// supported set are skipped.
fn entry_from_tar(record: &tar::Entry<'_, impl Read>) -> OcifsResult<Option<Entry>> {
    let header = record.header();

    let kind = match header.entry_type() {
        EntryType::Regular => EntryKind::Regular,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink,
        EntryType::Link => EntryKind::Hardlink,
        EntryType::Char => EntryKind::Char,
        EntryType::Block => EntryKind::Block,
        EntryType::Fifo => EntryKind::Fifo,
        other => {
            tracing::debug!(
                kind = ?other,
                path = %String::from_utf8_lossy(&record.path_bytes()),
                "skipping unsupported tar record"
            );
            return Ok(None);
        }
    };

    let name = String::from_utf8_lossy(&record.path_bytes()).into_owned();
    let mut entry = Entry::new(name, kind);
    entry.set_mode(header.mode()?);
    entry.set_uid(header.uid()? as u32);
    entry.set_gid(header.gid()? as u32);
    entry.set_size(header.size()?);

    let mtime = timestamp(header.mtime()? as i64);
    entry.set_mtime(mtime);
    let (atime, ctime) = match header.as_gnu() {
        Some(gnu) => (
            gnu.atime().map(|t| timestamp(t as i64)).unwrap_or(mtime),
            gnu.ctime().map(|t| timestamp(t as i64)).unwrap_or(mtime),
        ),
        None => (mtime, mtime),
    };
    entry.set_atime(atime);
    entry.set_ctime(ctime);

    if let Some(link) = record.link_name_bytes() {
        entry.set_link_name(Some(String::from_utf8_lossy(&link).into_owned()));
    }

    Ok(Some(entry))
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_digest(fill: char) -> Digest {
        format!("sha256:{}", fill.to_string().repeat(64))
            .parse()
            .unwrap()
    }

    fn build_tar(files: &[(&str, EntryType, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, entry_type, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*entry_type);
            header.set_mode(if *entry_type == EntryType::Directory {
                0o755
            } else {
                0o644
            });
            header.set_size(content.len() as u64);
            header.set_mtime(1_700_000_000);
            header.set_uid(0);
            header.set_gid(0);
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_records_entries_and_blobs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let blobs = BlobStore::new(tmp.path());
        let cache = LayerCache::new(blobs.clone());
        let digest = layer_digest('a');

        let tar_bytes = build_tar(&[
            ("app/", EntryType::Directory, ""),
            ("app/cfg", EntryType::Regular, "v1"),
            ("hello.txt", EntryType::Regular, "world"),
        ]);

        cache.unpack(&tar_bytes[..], &digest, &CancelToken::new())?;
        assert!(cache.is_unpacked(&digest));

        let layer = Layer::from_meta(digest, &std::fs::read(cache.meta_path(&layer_digest('a')))?)?;
        let entries = layer.get_entries();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].get_name(), "app/");
        assert_eq!(entries[0].get_kind(), EntryKind::Directory);
        assert!(entries[0].get_blob_path().is_none());

        assert_eq!(entries[1].get_name(), "app/cfg");
        assert_eq!(entries[1].get_size(), 2);
        let blob_path = entries[1].get_blob_path().clone().unwrap();
        assert_eq!(std::fs::read(&blob_path)?, b"v1");

        // the blob's file name is the hex of its content hash
        let hex_name = blob_path.file_name().unwrap().to_str().unwrap().to_string();
        let recomputed = blobs.put(&mut &b"v1"[..])?;
        assert_eq!(recomputed.digest(), hex_name);
        Ok(())
    }

    #[test]
    fn test_unpack_is_idempotent() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = LayerCache::new(BlobStore::new(tmp.path()));
        let digest = layer_digest('b');

        let tar_bytes = build_tar(&[("cfg", EntryType::Regular, "data")]);
        cache.unpack(&tar_bytes[..], &digest, &CancelToken::new())?;

        let meta_before = std::fs::read(cache.meta_path(&digest))?;
        let blobs_before: Vec<_> = std::fs::read_dir(tmp.path().join("sha256"))?
            .map(|e| e.unwrap().file_name())
            .collect();

        // a second unpack (even of garbage) is a no-op behind the checkpoint
        cache.unpack(&b"ignored"[..], &digest, &CancelToken::new())?;

        assert_eq!(std::fs::read(cache.meta_path(&digest))?, meta_before);
        let blobs_after: Vec<_> = std::fs::read_dir(tmp.path().join("sha256"))?
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(blobs_before.len(), blobs_after.len());
        Ok(())
    }

    #[test]
    fn test_unpack_honours_cancellation() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = LayerCache::new(BlobStore::new(tmp.path()));
        let digest = layer_digest('c');

        let cancel = CancelToken::new();
        cancel.cancel();

        let tar_bytes = build_tar(&[("cfg", EntryType::Regular, "data")]);
        assert!(matches!(
            cache.unpack(&tar_bytes[..], &digest, &cancel),
            Err(OcifsError::Cancelled)
        ));
        // no checkpoint was written
        assert!(!cache.is_unpacked(&digest));
        Ok(())
    }

    #[test]
    fn test_unpack_keeps_hardlink_targets() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache = LayerCache::new(BlobStore::new(tmp.path()));
        let digest = layer_digest('d');

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(4);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, "data", &b"abcd"[..])?;

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Link);
        link.set_mode(0o644);
        link.set_size(0);
        link.set_uid(0);
        link.set_gid(0);
        builder.append_link(&mut link, "alias", "data")?;
        let tar_bytes = builder.into_inner()?;

        cache.unpack(&tar_bytes[..], &digest, &CancelToken::new())?;
        let layer = Layer::from_meta(digest.clone(), &std::fs::read(cache.meta_path(&digest))?)?;

        let alias = &layer.get_entries()[1];
        assert_eq!(alias.get_kind(), EntryKind::Hardlink);
        assert_eq!(alias.get_link_name().as_deref(), Some("data"));
        assert!(alias.get_blob_path().is_none());
        Ok(())
    }
}
