use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an ocifs operation.
pub type OcifsResult<T> = Result<T, OcifsError>;

/// An error that occurred while resolving, pulling or mounting an image.
#[derive(Debug, Error)]
pub enum OcifsError {
    /// The reference is not in the store and the pull policy forbids pulling
    #[error("image {0} not found in store and pull policy is 'Never'")]
    RefNotFound(String),

    /// The registry returned an error or unusable data
    #[error("registry error: {0}")]
    Registry(String),

    /// On-disk state is damaged (bad digest, malformed metadata, missing blob)
    #[error("corrupt store: {0}")]
    CorruptStore(String),

    /// A referenced layer has no unpacked metadata; the image must be pulled
    #[error("layer {0} is not unpacked")]
    LayerNotUnpacked(String),

    /// The image index carries no manifest for this platform
    #[error("no manifest found for the current platform")]
    ManifestNotFound,

    /// The image reference string failed to parse
    #[error("invalid image reference: {0}")]
    ImageReference(String),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The mount point is already in use by this process
    #[error("mount point already in use: {0}")]
    AlreadyMounted(PathBuf),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the filesystem layer
    #[error(transparent)]
    UnionFs(#[from] unionfs::UnionFsError),

    /// An error from OCI document builders or parsers
    #[error(transparent)]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// JSON (de)serialisation error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Custom error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OcifsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> OcifsError {
        OcifsError::Custom(AnyError {
            error: error.into(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `OcifsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> OcifsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

impl From<reqwest::Error> for OcifsError {
    fn from(error: reqwest::Error) -> Self {
        OcifsError::Registry(error.to_string())
    }
}

impl From<reqwest_middleware::Error> for OcifsError {
    fn from(error: reqwest_middleware::Error) -> Self {
        OcifsError::Registry(error.to_string())
    }
}
