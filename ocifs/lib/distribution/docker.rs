use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use oci_spec::image::{Digest, ImageConfiguration, ImageIndex, ImageManifest};
use regex::Regex;
use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Keychain, OcifsError, OcifsResult, Reference};

use super::RegistryClient;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// API host serving docker.io pulls, as the registry name itself does not
/// resolve to the Registry HTTP API.
const DOCKER_REGISTRY_HOST: &str = "registry-1.docker.io";

/// Accept header offered when fetching indexes (manifest lists).
const INDEX_MIME_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Accept header offered when fetching single-platform manifests.
const MANIFEST_MIME_TYPES: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Response header carrying the digest of a manifest.
const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`RegistryClient`] speaking the Docker Registry HTTP API v2, with
/// token authentication discovered from the registry's `WWW-Authenticate`
/// challenge and transparent retries on transient transport failures.
///
/// [See OCI distribution specification for the manifest schema][OCI Distribution Spec]
///
/// [OCI Distribution Spec]: https://distribution.github.io/distribution/spec/api/#introduction
#[derive(Debug)]
pub struct DockerRegistry {
    /// The HTTP client used to make requests to the registry.
    client: ClientWithMiddleware,

    /// Credentials applied during token exchange.
    keychain: Keychain,
}

/// A bearer-token challenge parsed from a `WWW-Authenticate` header.
#[derive(Debug, PartialEq)]
struct AuthChallenge {
    realm: String,
    service: Option<String>,
}

/// Token material returned by a registry's authorization service.
#[derive(Debug, Serialize, Deserialize)]
struct TokenResponse {
    token: String,
}

/// A registry response body: the expected document, or a structured error.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RegistryResponse<T> {
    /// The requested document.
    Ok(T),

    /// A structured error from the registry.
    Error(RegistryResponseError),
}

/// A structured error payload from the registry.
#[derive(Debug, Serialize, Deserialize, Error)]
#[error("registry error: {errors}")]
struct RegistryResponseError {
    errors: serde_json::Value,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerRegistry {
    /// Creates a client with an anonymous keychain.
    pub fn new() -> Self {
        Self::with_keychain(Keychain::new())
    }

    /// Creates a client resolving credentials from `keychain` during token
    /// exchange.
    pub fn with_keychain(keychain: Keychain) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { client, keychain }
    }

    /// Returns the API base URL for a reference's registry.
    fn base_url(reference: &Reference) -> String {
        let registry = reference.get_registry();
        let host = if registry == crate::utils::DEFAULT_REGISTRY {
            DOCKER_REGISTRY_HOST
        } else {
            registry.as_str()
        };
        format!("https://{}/v2", host)
    }

    /// Obtains a bearer token for pulling `reference`, if its registry
    /// requires one.
    ///
    /// The token endpoint is discovered from the `WWW-Authenticate`
    /// challenge on the registry's `/v2/` root; registries answering 200
    /// there need no token.
    async fn authenticate(&self, reference: &Reference) -> OcifsResult<Option<String>> {
        let probe = format!("{}/", Self::base_url(reference));
        let response = self.client.get(&probe).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| {
                OcifsError::Registry(format!(
                    "registry {} sent an unusable auth challenge",
                    reference.get_registry()
                ))
            })?;

        let scope = format!("repository:{}:pull", reference.get_repository());
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let mut request = self.client.get(&challenge.realm).query(&query);
        let resource = format!(
            "{}/{}",
            reference.get_registry(),
            reference.get_repository()
        );
        if let Some(credentials) = self.keychain.resolve(&resource) {
            request = request.basic_auth(
                credentials.get_username(),
                Some(credentials.get_password()),
            );
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OcifsError::Registry(format!(
                "token exchange failed with status {}",
                response.status()
            )));
        }
        let token = response.json::<TokenResponse>().await?;

        Ok(Some(token.token))
    }

    /// Builds a GET against the registry API with the pull token applied.
    async fn get(&self, reference: &Reference, path: &str) -> OcifsResult<RequestBuilder> {
        let url = format!(
            "{}/{}/{}",
            Self::base_url(reference),
            reference.get_repository(),
            path
        );
        let mut request = self.client.get(&url);
        if let Some(token) = self.authenticate(reference).await? {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl RegistryClient for DockerRegistry {
    async fn fetch_index(&self, reference: &Reference) -> OcifsResult<ImageIndex> {
        let request = self
            .get(reference, &format!("manifests/{}", reference.identifier()))
            .await?
            .header(reqwest::header::ACCEPT, INDEX_MIME_TYPES);

        let response = request.send().await?;
        match response.json::<RegistryResponse<ImageIndex>>().await? {
            RegistryResponse::Ok(index) => Ok(index),
            RegistryResponse::Error(err) => Err(OcifsError::Registry(err.to_string())),
        }
    }

    async fn fetch_manifest(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> OcifsResult<ImageManifest> {
        let request = self
            .get(reference, &format!("manifests/{}", digest))
            .await?
            .header(reqwest::header::ACCEPT, MANIFEST_MIME_TYPES);

        let response = request.send().await?;
        match response.json::<RegistryResponse<ImageManifest>>().await? {
            RegistryResponse::Ok(manifest) => Ok(manifest),
            RegistryResponse::Error(err) => Err(OcifsError::Registry(err.to_string())),
        }
    }

    async fn fetch_config(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> OcifsResult<ImageConfiguration> {
        let request = self.get(reference, &format!("blobs/{}", digest)).await?;

        let response = request.send().await?;
        match response
            .json::<RegistryResponse<ImageConfiguration>>()
            .await?
        {
            RegistryResponse::Ok(config) => Ok(config),
            RegistryResponse::Error(err) => Err(OcifsError::Registry(err.to_string())),
        }
    }

    async fn head_digest(&self, reference: &Reference) -> OcifsResult<Digest> {
        let url = format!(
            "{}/{}/manifests/{}",
            Self::base_url(reference),
            reference.get_repository(),
            reference.identifier()
        );
        let mut request = self
            .client
            .head(&url)
            .header(reqwest::header::ACCEPT, INDEX_MIME_TYPES);
        if let Some(token) = self.authenticate(reference).await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OcifsError::Registry(format!(
                "HEAD {} failed with status {}",
                reference,
                response.status()
            )));
        }

        response
            .headers()
            .get(CONTENT_DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Digest>().ok())
            .ok_or_else(|| {
                OcifsError::Registry(format!("HEAD {} returned no usable digest", reference))
            })
    }

    async fn fetch_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        offset: u64,
    ) -> OcifsResult<BoxStream<'static, OcifsResult<Bytes>>> {
        tracing::debug!(%reference, %digest, offset, "fetching blob");

        let mut request = self.get(reference, &format!("blobs/{}", digest)).await?;
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OcifsError::Registry(format!(
                "blob {} fetch failed with status {}",
                digest,
                response.status()
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(OcifsError::from));

        Ok(stream.boxed())
    }
}

impl Default for DockerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses `Bearer realm="…",service="…"` into its parts; returns `None` for
/// other schemes.
fn parse_bearer_challenge(header: &str) -> Option<AuthChallenge> {
    if !header.trim_start().starts_with("Bearer") {
        return None;
    }

    let realm = Regex::new(r#"realm="([^"]+)""#)
        .unwrap()
        .captures(header)?
        .get(1)?
        .as_str()
        .to_string();
    let service = Regex::new(r#"service="([^"]+)""#)
        .unwrap()
        .captures(header)
        .and_then(|captures| captures.get(1))
        .map(|capture| capture.as_str().to_string());

    Some(AuthChallenge { realm, service })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
