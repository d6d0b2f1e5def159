use bytes::Bytes;
use futures::stream::BoxStream;
use oci_spec::image::{Digest, ImageConfiguration, ImageIndex, ImageManifest};

use crate::{OcifsResult, Reference};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Methods for pulling image material from an OCI-compliant registry.
///
/// The puller consumes this trait exclusively; swapping the transport (or a
/// test double) never touches the store.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetches the image index (manifest list) for the reference.
    async fn fetch_index(&self, reference: &Reference) -> OcifsResult<ImageIndex>;

    /// Fetches an image manifest by digest.
    async fn fetch_manifest(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> OcifsResult<ImageManifest>;

    /// Fetches the image configuration by digest.
    async fn fetch_config(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> OcifsResult<ImageConfiguration>;

    /// Resolves the reference to its current digest without fetching a body
    /// (a registry HEAD request).
    async fn head_digest(&self, reference: &Reference) -> OcifsResult<Digest>;

    /// Fetches a blob by digest as a byte stream, starting at `offset` so an
    /// interrupted download can resume.
    async fn fetch_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        offset: u64,
    ) -> OcifsResult<BoxStream<'static, OcifsResult<Bytes>>>;
}
