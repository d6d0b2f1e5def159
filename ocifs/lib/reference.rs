//! Image reference parsing and canonicalisation.

use std::{fmt, str::FromStr};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::{utils, OcifsError};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The tag assumed when a reference names none.
pub const DEFAULT_TAG: &str = "latest";

/// The namespace prepended to single-segment repositories (`alpine` →
/// `library/alpine`), matching registry convention.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed, canonical image reference.
///
/// The canonical form is `<registry>/<repository>:<tag>` or
/// `<registry>/<repository>@<digest>`. A missing registry defaults to the
/// value of [`utils::default_registry`]; a missing tag defaults to
/// [`DEFAULT_TAG`]; digest identifiers are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Reference {
    /// The registry hosting the image.
    registry: String,

    /// The repository name of the image.
    repository: String,

    /// The tag or digest selecting the image within the repository.
    selector: ReferenceSelector,
}

/// The selector part of an image reference: a tag, or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSelector {
    /// Tag variant (e.g. `:3.21`).
    Tag(String),

    /// Digest variant (e.g. `@sha256:…`), pinned content.
    Digest(Digest),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Returns the identifier used in the canonical form and in the
    /// reference store layout: the tag, or the digest in `algo:hex` form.
    pub fn identifier(&self) -> String {
        match &self.selector {
            ReferenceSelector::Tag(tag) => tag.clone(),
            ReferenceSelector::Digest(digest) => digest.to_string(),
        }
    }

    /// Returns the pinned digest for digest references, `None` for tags.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.selector {
            ReferenceSelector::Tag(_) => None,
            ReferenceSelector::Digest(digest) => Some(digest),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = OcifsError;

    /// Parses a string slice into a canonical image [`Reference`].
    ///
    /// Supported formats include:
    /// - "registry/repository:tag"
    /// - "repository:tag"
    /// - "repository"
    /// - "registry/repository@digest"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let default_registry = utils::default_registry();

        if s.is_empty() {
            return Err(OcifsError::ImageReference("input string is empty".into()));
        }

        if let Some(at_idx) = s.find('@') {
            let digest_str = &s[at_idx + 1..];
            if !digest_str.contains(':') {
                return Err(OcifsError::ImageReference(format!(
                    "invalid digest: {}",
                    digest_str
                )));
            }
            let digest = digest_str.parse::<Digest>().map_err(|err| {
                OcifsError::ImageReference(format!("invalid digest: {}", err))
            })?;

            let (registry, remainder) = extract_registry_and_path(&s[..at_idx], &default_registry);
            let (repository, _) = extract_repository_and_tag(remainder)?;

            validate_registry(&registry)?;
            validate_repository(&repository)?;

            Ok(Reference {
                registry,
                repository,
                selector: ReferenceSelector::Digest(digest),
            })
        } else {
            let (registry, remainder) = extract_registry_and_path(s, &default_registry);
            let (repository, tag) = extract_repository_and_tag(remainder)?;

            validate_registry(&registry)?;
            validate_repository(&repository)?;
            validate_tag(&tag)?;

            Ok(Reference {
                registry,
                repository,
                selector: ReferenceSelector::Tag(tag),
            })
        }
    }
}

impl fmt::Display for Reference {
    /// Formats the reference in its canonical form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            ReferenceSelector::Tag(tag) => write!(f, ":{}", tag),
            ReferenceSelector::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates the registry host: alphanumerics, dashes, dots and an optional
/// port.
fn validate_registry(registry: &str) -> Result<(), OcifsError> {
    let re = Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").unwrap();
    if re.is_match(registry) {
        Ok(())
    } else {
        Err(OcifsError::ImageReference(format!(
            "invalid registry: {}",
            registry
        )))
    }
}

/// Validates the repository name: lowercase segments joined by `/`, each
/// allowing `._-` separators.
fn validate_repository(repository: &str) -> Result<(), OcifsError> {
    let re =
        Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap();
    if re.is_match(repository) {
        Ok(())
    } else {
        Err(OcifsError::ImageReference(format!(
            "invalid repository: {}",
            repository
        )))
    }
}

/// Validates a tag: a word character followed by up to 127 word characters,
/// dots or dashes.
fn validate_tag(tag: &str) -> Result<(), OcifsError> {
    let re = Regex::new(r"^\w[\w.-]{0,127}$").unwrap();
    if re.is_match(tag) {
        Ok(())
    } else {
        Err(OcifsError::ImageReference(format!("invalid tag: {}", tag)))
    }
}

/// Splits off the registry when the first segment looks like a host
/// (contains a dot or port, or is `localhost`); otherwise the default
/// registry applies.
fn extract_registry_and_path<'a>(reference: &'a str, default_registry: &str) -> (String, &'a str) {
    let segments: Vec<&str> = reference.splitn(2, '/').collect();
    if segments.len() > 1
        && (segments[0].contains('.') || segments[0].contains(':') || segments[0] == "localhost")
    {
        (segments[0].to_string(), segments[1])
    } else {
        (default_registry.to_string(), reference)
    }
}

/// Splits the repository and tag, applying the default namespace to
/// single-segment repositories and the default tag when none is given.
fn extract_repository_and_tag(path: &str) -> Result<(String, String), OcifsError> {
    let (repo_part, tag) = match path.rfind(':') {
        Some(idx) => (&path[..idx], path[idx + 1..].to_string()),
        None => (path, DEFAULT_TAG.to_string()),
    };

    if repo_part.is_empty() {
        return Err(OcifsError::ImageReference("repository is empty".into()));
    }

    let repository = if !repo_part.contains('/') {
        format!("{}/{}", DEFAULT_REPO_NAMESPACE, repo_part)
    } else {
        repo_part.to_string()
    };

    Ok((repository, tag))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
