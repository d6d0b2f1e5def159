//! The layer store: reference bindings, content-addressed blobs, unpacked
//! layer metadata, the OCI image layout and the puller that populates them.

mod blobs;
mod layer;
mod layout;
mod refs;

use std::{fmt, path::PathBuf, sync::Arc};

use futures::StreamExt;
use getset::Getters;
use oci_spec::image::{
    Arch, Descriptor, Digest, ImageConfiguration, ImageIndex, Os, Platform,
};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use unionfs::Entry;
use uuid::Uuid;

use crate::{
    distribution::RegistryClient,
    utils::{BLOBS_SUBDIR, MOUNTS_SUBDIR, OCI_SUBDIR, REFS_SUBDIR},
    CancelToken, OcifsError, OcifsResult, Reference,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use blobs::*;
pub use layer::*;
pub use layout::*;
pub use refs::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Annotation marking attestation manifests, which never carry a runnable
/// platform.
const REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// When to consult the registry for a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Pull only when the reference store has no binding.
    #[default]
    IfNotPresent,

    /// Ask the registry on every resolve; re-pull when the digest moved.
    Always,

    /// Never touch the registry; an unbound reference is an error.
    Never,
}

/// An assembled image: digest, configuration and unpacked layers ordered
/// base to top.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Image {
    /// The manifest digest the reference resolved to.
    digest: Digest,

    /// The OCI image configuration.
    config: ImageConfiguration,

    /// Unpacked layers, base first.
    layers: Vec<Layer>,
}

/// The on-disk work directory and everything living in it.
///
/// ```text
/// <workdir>/
///   refs/<registry>/<repo>/<identifier>   reference bindings
///   blobs/<algo>/<hex>[.meta]             content blobs + layer metadata
///   oci/                                  OCI image layout
///   mounts/<id>/                          auto-created mount points
/// ```
pub struct Store {
    work_dir: PathBuf,
    refs: RefStore,
    blobs: BlobStore,
    layers: LayerCache,
    layout: OciLayout,
    client: Arc<dyn RegistryClient>,
    pull_policy: PullPolicy,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Image {
    /// Returns the layers as entry slices, the shape the flattener takes.
    pub fn layer_slices(&self) -> Vec<&[Arc<Entry>]> {
        self.layers
            .iter()
            .map(|layer| layer.get_entries().as_slice())
            .collect()
    }
}

impl Store {
    /// Opens (or initialises) the store in `work_dir`.
    pub async fn open(
        work_dir: impl Into<PathBuf>,
        client: Arc<dyn RegistryClient>,
        pull_policy: PullPolicy,
    ) -> OcifsResult<Self> {
        let work_dir = work_dir.into();
        for sub in [REFS_SUBDIR, MOUNTS_SUBDIR] {
            tokio::fs::create_dir_all(work_dir.join(sub)).await?;
        }
        tokio::fs::create_dir_all(work_dir.join(BLOBS_SUBDIR).join("sha256")).await?;
        let layout = OciLayout::open(work_dir.join(OCI_SUBDIR)).await?;

        let blobs = BlobStore::new(work_dir.join(BLOBS_SUBDIR));
        Ok(Self {
            refs: RefStore::new(work_dir.join(REFS_SUBDIR)),
            layers: LayerCache::new(blobs.clone()),
            blobs,
            layout,
            client,
            pull_policy,
            work_dir,
        })
    }

    /// Returns the store's work directory.
    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    /// Creates a fresh mount point under `mounts/`, named `id` or a random
    /// UUID. An existing directory of the same name is an error.
    pub async fn new_mount_dir(&self, id: Option<&str>) -> OcifsResult<PathBuf> {
        let id = match id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.work_dir.join(MOUNTS_SUBDIR).join(id);
        tokio::fs::create_dir(&path).await?;
        Ok(path)
    }

    /// Resolves a reference to a digest under the store's pull policy,
    /// pulling and unpacking the image when needed.
    pub async fn resolve(
        &self,
        reference: &Reference,
        cancel: &CancelToken,
    ) -> OcifsResult<Digest> {
        let cached = self.refs.get(reference).await?;

        match (cached, self.pull_policy) {
            (None, PullPolicy::Never) => Err(OcifsError::RefNotFound(reference.to_string())),
            (Some(digest), PullPolicy::Never) => Ok(digest),
            (Some(digest), PullPolicy::IfNotPresent) => Ok(digest),
            (Some(digest), PullPolicy::Always) => {
                let head = self.client.head_digest(reference).await?;
                if head == digest {
                    return Ok(digest);
                }
                self.pull(reference, cancel).await
            }
            (None, _) => self.pull(reference, cancel).await,
        }
    }

    /// Assembles the image stored under `digest`: manifest, configuration
    /// and every layer's unpacked entry list.
    pub async fn image(&self, digest: &Digest) -> OcifsResult<Image> {
        let manifest = self.layout.manifest(digest).await?;
        let config = self.layout.config(manifest.config().digest()).await?;

        let mut layers = Vec::with_capacity(manifest.layers().len());
        for descriptor in manifest.layers() {
            let layer_digest = descriptor.digest().clone();
            let meta_path = self.layers.meta_path(&layer_digest);
            let data = match tokio::fs::read(&meta_path).await {
                Result::Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(OcifsError::LayerNotUnpacked(layer_digest.to_string()))
                }
                Err(err) => return Err(err.into()),
            };
            layers.push(Layer::from_meta(layer_digest, &data)?);
        }

        Ok(Image {
            digest: digest.clone(),
            config,
            layers,
        })
    }

    /// Pulls the image behind `reference`: index, platform manifest, config
    /// and every layer, unpacked through the layer cache. The reference is
    /// bound only after all layers landed, so a crash mid-pull leaves the
    /// binding untouched and the retry reuses whatever blobs survived.
    async fn pull(&self, reference: &Reference, cancel: &CancelToken) -> OcifsResult<Digest> {
        cancel.check()?;
        tracing::info!(%reference, "pulling image");

        let index = self.client.fetch_index(reference).await?;
        let descriptor = select_platform_manifest(&index)?.clone();
        let digest = descriptor.digest().clone();

        let manifest = self.client.fetch_manifest(reference, &digest).await?;
        self.layout.put_document(&digest, &manifest).await?;

        let config = self
            .client
            .fetch_config(reference, manifest.config().digest())
            .await?;
        self.layout
            .put_document(manifest.config().digest(), &config)
            .await?;
        self.layout.append_descriptor(descriptor).await?;

        for layer_descriptor in manifest.layers() {
            cancel.check()?;
            if self.layers.is_unpacked(layer_descriptor.digest()) {
                continue;
            }
            self.fetch_and_unpack_layer(reference, layer_descriptor, cancel)
                .await?;
        }

        self.refs.put(reference, &digest).await?;
        Ok(digest)
    }

    async fn fetch_and_unpack_layer(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> OcifsResult<()> {
        let digest = descriptor.digest();

        if !self.blobs.contains(digest) {
            self.download_layer_blob(reference, descriptor, cancel)
                .await?;
        }

        let blob_path = self.blobs.path_of(digest);
        let gzip = is_gzip_media_type(descriptor.media_type());
        let cache = self.layers.clone();
        let digest = digest.clone();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || -> OcifsResult<()> {
            let file = std::fs::File::open(&blob_path)?;
            let reader = std::io::BufReader::new(file);
            if gzip {
                cache.unpack(flate2::read::GzDecoder::new(reader), &digest, &cancel)
            } else {
                cache.unpack(reader, &digest, &cancel)
            }
        })
        .await
        .map_err(OcifsError::custom)?
    }

    /// Downloads a layer blob into the blob store, resuming a partial
    /// download when one is lying around and verifying the digest before
    /// the blob is adopted.
    async fn download_layer_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> OcifsResult<()> {
        cancel.check()?;
        let digest = descriptor.digest();
        let target = self.blobs.path_of(digest);
        let partial = target.with_file_name(format!("{}.partial", digest.digest()));

        let offset = match tokio::fs::metadata(&partial).await {
            Result::Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut file = if offset > 0 {
            tracing::info!(%digest, offset, "resuming layer download");
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await?
        } else {
            tokio::fs::File::create(&partial).await?
        };

        let mut stream = self.client.fetch_blob(reference, digest, offset).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        // verify before adopting
        let expected = digest.digest().to_string();
        let verify_path = partial.clone();
        let actual = tokio::task::spawn_blocking(move || -> OcifsResult<String> {
            let mut file = std::fs::File::open(&verify_path)?;
            let mut hasher = Sha256::new();
            std::io::copy(&mut file, &mut hasher)?;
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .map_err(OcifsError::custom)??;

        if actual != expected {
            tokio::fs::remove_file(&partial).await?;
            return Err(OcifsError::Registry(format!(
                "layer {} hash mismatch: got {}",
                digest, actual
            )));
        }

        tokio::fs::rename(&partial, &target).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullPolicy::IfNotPresent => write!(f, "IfNotPresent"),
            PullPolicy::Always => write!(f, "Always"),
            PullPolicy::Never => write!(f, "Never"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Selects the manifest for the current platform: linux + matching
/// architecture first, then a matching architecture on any OS, skipping
/// attestation manifests throughout.
pub fn select_platform_manifest(index: &ImageIndex) -> OcifsResult<&Descriptor> {
    let platform = Platform::default();

    index
        .manifests()
        .iter()
        .find(|descriptor| {
            descriptor.platform().as_ref().is_some_and(|p| {
                matches!(p.os(), Os::Linux)
                    && p.architecture() == platform.architecture()
                    && !is_attestation(descriptor)
            })
        })
        .or_else(|| {
            index.manifests().iter().find(|descriptor| {
                descriptor.platform().as_ref().is_some_and(|p| {
                    p.architecture() == platform.architecture() && !is_attestation(descriptor)
                })
            })
        })
        .ok_or(OcifsError::ManifestNotFound)
}

/// Returns whether a descriptor marks an attestation manifest.
fn is_attestation(descriptor: &Descriptor) -> bool {
    descriptor
        .annotations()
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(REFERENCE_TYPE_ANNOTATION))
}

/// Returns the architecture of the current platform.
pub fn current_architecture() -> Arch {
    Platform::default().architecture().clone()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{DescriptorBuilder, ImageIndexBuilder, MediaType, PlatformBuilder};
    use std::collections::HashMap;

    fn test_digest(fill: char) -> Digest {
        format!("sha256:{}", fill.to_string().repeat(64))
            .parse()
            .unwrap()
    }

    fn manifest_descriptor(
        fill: char,
        os: Os,
        arch: Arch,
        attestation: bool,
    ) -> Descriptor {
        let mut builder = DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(test_digest(fill))
            .size(1u64)
            .platform(
                PlatformBuilder::default()
                    .os(os)
                    .architecture(arch)
                    .build()
                    .unwrap(),
            );
        if attestation {
            builder = builder.annotations(HashMap::from([(
                REFERENCE_TYPE_ANNOTATION.to_string(),
                "attestation-manifest".to_string(),
            )]));
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_select_prefers_linux_on_current_arch() {
        let arch = current_architecture();
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![
                manifest_descriptor('9', Os::Windows, arch.clone(), false),
                manifest_descriptor('1', Os::Linux, arch.clone(), false),
            ])
            .build()
            .unwrap();

        let selected = select_platform_manifest(&index).unwrap();
        assert_eq!(selected.digest(), &test_digest('1'));
    }

    #[test]
    fn test_select_skips_attestation_manifests() {
        let arch = current_architecture();
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![
                manifest_descriptor('a', Os::Linux, arch.clone(), true),
                manifest_descriptor('1', Os::Linux, arch.clone(), false),
            ])
            .build()
            .unwrap();

        let selected = select_platform_manifest(&index).unwrap();
        assert_eq!(selected.digest(), &test_digest('1'));
    }

    #[test]
    fn test_select_falls_back_to_arch_only() {
        let arch = current_architecture();
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(vec![manifest_descriptor('d', Os::Darwin, arch, false)])
            .build()
            .unwrap();

        let selected = select_platform_manifest(&index).unwrap();
        assert_eq!(selected.digest(), &test_digest('d'));
    }

    #[test]
    fn test_select_errors_without_match() {
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(Vec::<Descriptor>::new())
            .build()
            .unwrap();

        assert!(matches!(
            select_platform_manifest(&index),
            Err(OcifsError::ManifestNotFound)
        ));
    }

    #[test]
    fn test_pull_policy_display() {
        assert_eq!(PullPolicy::IfNotPresent.to_string(), "IfNotPresent");
        assert_eq!(PullPolicy::Always.to_string(), "Always");
        assert_eq!(PullPolicy::Never.to_string(), "Never");
    }
}
