use std::{
    io::{Read, Write},
    path::PathBuf,
};

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;

use crate::{OcifsError, OcifsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Copy buffer for streaming bodies into the store.
const COPY_BUFFER_SIZE: usize = 256 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Content-addressed, write-once storage under `blobs/<algo>/<hex>`.
///
/// Bodies stream into a temp file while being hashed and are renamed into
/// their content address on completion; a blob that already exists simply
/// absorbs the write. There is no deletion.
///
/// The API is synchronous: every caller is a tar-unpacking loop that already
/// runs on a blocking task.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BlobStore {
    /// Creates a blob store rooted at `dir` (the `blobs/` directory).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the root directory of the store.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Returns the content address of `digest`.
    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        self.dir
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    /// Returns whether the store holds `digest`.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.path_of(digest).exists()
    }

    /// Streams `reader` to completion into the store and returns the
    /// resulting digest.
    pub fn put(&self, reader: &mut impl Read) -> OcifsResult<Digest> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }

        let digest = format!("sha256:{}", hex::encode(hasher.finalize()))
            .parse::<Digest>()
            .map_err(|err| OcifsError::CorruptStore(format!("computed digest: {}", err)))?;

        self.adopt(tmp, &digest)?;
        Ok(digest)
    }

    /// Moves a fully written temp file to the content address of `digest`.
    /// When the address is already occupied the temp file is discarded.
    pub fn adopt(&self, tmp: NamedTempFile, digest: &Digest) -> OcifsResult<()> {
        let target = self.path_of(digest);
        if target.exists() {
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tmp.persist(&target).map_err(|err| OcifsError::Io(err.error))?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_content_addressed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path());

        let digest = store.put(&mut &b"hello blob"[..])?;
        let path = store.path_of(&digest);
        assert!(path.exists());
        assert_eq!(std::fs::read(&path)?, b"hello blob");

        // the file name is the hex of its own hash
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            digest.digest()
        );
        assert!(store.contains(&digest));
        Ok(())
    }

    #[test]
    fn test_put_twice_yields_one_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path());

        let first = store.put(&mut &b"same bytes"[..])?;
        let second = store.put(&mut &b"same bytes"[..])?;
        assert_eq!(first, second);

        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("sha256"))?.collect();
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn test_adopt_keeps_existing_content() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = BlobStore::new(tmp.path());

        let digest = store.put(&mut &b"original"[..])?;

        // adopting a second temp file for the same digest is a no-op
        let mut replacement = NamedTempFile::new_in(tmp.path())?;
        replacement.write_all(b"poisoned")?;
        store.adopt(replacement, &digest)?;

        assert_eq!(std::fs::read(store.path_of(&digest))?, b"original");
        Ok(())
    }
}
