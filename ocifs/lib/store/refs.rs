use std::path::PathBuf;

use oci_spec::image::Digest;
use tokio::fs;

use crate::{OcifsError, OcifsResult, Reference};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// On-disk reference → digest bindings.
///
/// Each binding is one file at `refs/<registry>/<repository>/<identifier>`
/// whose contents are the digest in `algo:hex` form. Writes go through a
/// temp file and a rename, so a binding is always either absent or whole.
#[derive(Debug)]
pub struct RefStore {
    dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RefStore {
    /// Creates a reference store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, reference: &Reference) -> PathBuf {
        self.dir
            .join(reference.get_registry())
            .join(reference.get_repository())
            .join(reference.identifier())
    }

    /// Returns the bound digest, or `None` when the reference was never
    /// stored. Malformed contents are a [`OcifsError::CorruptStore`] error.
    pub async fn get(&self, reference: &Reference) -> OcifsResult<Option<Digest>> {
        let path = self.path_for(reference);
        let data = match fs::read_to_string(&path).await {
            Result::Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let digest = data.trim().parse::<Digest>().map_err(|err| {
            OcifsError::CorruptStore(format!("invalid digest for ref {}: {}", reference, err))
        })?;

        Ok(Some(digest))
    }

    /// Binds (or rebinds) the reference to `digest`.
    pub async fn put(&self, reference: &Reference, digest: &Digest) -> OcifsResult<()> {
        let path = self.path_for(reference);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_file_name(format!("{}.tmp", reference.identifier()));
        fs::write(&tmp_path, digest.to_string()).await?;
        fs::rename(&tmp_path, &path).await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
