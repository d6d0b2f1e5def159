use std::path::PathBuf;

use oci_spec::image::{
    Descriptor, Digest, ImageConfiguration, ImageIndex, ImageIndexBuilder, ImageManifest,
    MediaType,
};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs;

use crate::{
    utils::{OCI_INDEX_FILENAME, OCI_LAYOUT_FILENAME},
    OcifsError, OcifsResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Contents of the `oci-layout` marker file.
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A minimal OCI image layout: `oci-layout` marker, `index.json` and a
/// `blobs/<algo>/<hex>` tree holding manifests and configs.
///
/// Documents fetched from a registry are stored under the digest the
/// registry declared for them, so the assembler can find a manifest by the
/// digest a reference resolves to.
#[derive(Debug)]
pub struct OciLayout {
    dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciLayout {
    /// Opens (or initialises) the layout rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> OcifsResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("blobs/sha256")).await?;

        let marker = dir.join(OCI_LAYOUT_FILENAME);
        if !marker.exists() {
            fs::write(&marker, OCI_LAYOUT_CONTENT).await?;
        }

        let index_path = dir.join(OCI_INDEX_FILENAME);
        if !index_path.exists() {
            let index = ImageIndexBuilder::default()
                .schema_version(2u32)
                .manifests(Vec::<Descriptor>::new())
                .build()?;
            fs::write(&index_path, serde_json::to_vec_pretty(&index)?).await?;
        }

        Ok(Self { dir })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }

    /// Stores a serialisable OCI document under `digest`.
    pub async fn put_document<T: Serialize>(
        &self,
        digest: &Digest,
        document: &T,
    ) -> OcifsResult<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec(document)?;
        let tmp_path = path.with_file_name(format!("{}.tmp", digest.digest()));
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, &path).await?;

        Ok(())
    }

    /// Loads the document stored under `digest`.
    pub async fn document<T: DeserializeOwned>(&self, digest: &Digest) -> OcifsResult<T> {
        let path = self.blob_path(digest);
        let data = match fs::read(&path).await {
            Result::Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OcifsError::CorruptStore(format!(
                    "oci layout has no blob for {}",
                    digest
                )))
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&data)
            .map_err(|err| OcifsError::CorruptStore(format!("oci blob {}: {}", digest, err)))
    }

    /// Loads the manifest stored under `digest`.
    pub async fn manifest(&self, digest: &Digest) -> OcifsResult<ImageManifest> {
        self.document(digest).await
    }

    /// Loads the image configuration stored under `digest`.
    pub async fn config(&self, digest: &Digest) -> OcifsResult<ImageConfiguration> {
        self.document(digest).await
    }

    /// Appends a manifest descriptor to `index.json`, once.
    pub async fn append_descriptor(&self, descriptor: Descriptor) -> OcifsResult<()> {
        let index_path = self.dir.join(OCI_INDEX_FILENAME);
        let data = fs::read(&index_path).await?;
        let mut index: ImageIndex = serde_json::from_slice(&data)
            .map_err(|err| OcifsError::CorruptStore(format!("oci index: {}", err)))?;

        let mut manifests = index.manifests().clone();
        if manifests
            .iter()
            .any(|existing| existing.digest() == descriptor.digest())
        {
            return Ok(());
        }
        manifests.push(descriptor);
        index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(manifests)
            .build()?;

        let tmp_path = self.dir.join(format!("{}.tmp", OCI_INDEX_FILENAME));
        fs::write(&tmp_path, serde_json::to_vec_pretty(&index)?).await?;
        fs::rename(&tmp_path, &index_path).await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the digest a registry would declare for a serialised document.
pub fn document_digest<T: Serialize>(document: &T) -> OcifsResult<(Digest, u64)> {
    let data = serde_json::to_vec(document)?;
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)))
        .parse::<Digest>()
        .map_err(|err| OcifsError::CorruptStore(format!("computed digest: {}", err)))?;
    Ok((digest, data.len() as u64))
}

/// Returns whether a layer media type carries gzip compression.
pub fn is_gzip_media_type(media_type: &MediaType) -> bool {
    media_type.to_string().ends_with("gzip")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{DescriptorBuilder, ImageManifestBuilder};

    fn test_digest(fill: char) -> Digest {
        format!("sha256:{}", fill.to_string().repeat(64))
            .parse()
            .unwrap()
    }

    fn test_manifest() -> ImageManifest {
        ImageManifestBuilder::default()
            .schema_version(2u32)
            .config(
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageConfig)
                    .digest(test_digest('c'))
                    .size(2u64)
                    .build()
                    .unwrap(),
            )
            .layers(vec![])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_initialises_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        OciLayout::open(tmp.path()).await?;

        assert!(tmp.path().join(OCI_LAYOUT_FILENAME).exists());
        assert!(tmp.path().join(OCI_INDEX_FILENAME).exists());
        assert!(tmp.path().join("blobs/sha256").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_document_round_trip() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = OciLayout::open(tmp.path()).await?;

        let manifest = test_manifest();
        let digest = test_digest('1');
        layout.put_document(&digest, &manifest).await?;

        let loaded = layout.manifest(&digest).await?;
        assert_eq!(loaded, manifest);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_document_is_corrupt_store() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = OciLayout::open(tmp.path()).await?;

        assert!(matches!(
            layout.manifest(&test_digest('2')).await,
            Err(OcifsError::CorruptStore(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_append_descriptor_once() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let layout = OciLayout::open(tmp.path()).await?;

        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(test_digest('1'))
            .size(42u64)
            .build()?;

        layout.append_descriptor(descriptor.clone()).await?;
        layout.append_descriptor(descriptor).await?;

        let data = std::fs::read(tmp.path().join(OCI_INDEX_FILENAME))?;
        let index: ImageIndex = serde_json::from_slice(&data)?;
        assert_eq!(index.manifests().len(), 1);
        Ok(())
    }

    #[test]
    fn test_is_gzip_media_type() {
        assert!(is_gzip_media_type(&MediaType::ImageLayerGzip));
        assert!(is_gzip_media_type(&MediaType::Other(
            "application/vnd.docker.image.rootfs.diff.tar.gzip".into()
        )));
        assert!(!is_gzip_media_type(&MediaType::ImageLayer));
    }
}
