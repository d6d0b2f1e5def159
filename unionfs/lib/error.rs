use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use nix::errno::Errno;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a union filesystem operation.
pub type UnionFsResult<T> = Result<T, UnionFsError>;

/// An error that occurred during a union filesystem operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum UnionFsError {
    /// The path does not exist in any layer
    #[error("path does not exist: {0}")]
    NotFound(String),

    /// The path already exists
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// The path is not a directory
    #[error("path is not a directory: {0}")]
    NotADirectory(String),

    /// The mount has no writable layer
    #[error("filesystem is read-only")]
    ReadOnlyFilesystem,

    /// The file handle is unknown or was already released
    #[error("unknown file handle: {0}")]
    BadHandle(u64),

    /// A persisted metadata file could not be decoded
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// The filesystem tree was dropped while a node was still in use
    #[error("filesystem tree is no longer attached")]
    Detached,

    /// IO error during a filesystem operation
    #[error("io error: {0}")]
    Io(#[from] io::Error),

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

impl UnionFsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> UnionFsError {
        UnionFsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the errno a kernel adapter should report for this error.
    pub fn errno(&self) -> Errno {
        self.into()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `UnionFsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> UnionFsResult<T> {
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

impl From<&UnionFsError> for Errno {
    fn from(error: &UnionFsError) -> Self {
        match error {
            UnionFsError::NotFound(_) => Errno::ENOENT,
            UnionFsError::AlreadyExists(_) => Errno::EEXIST,
            UnionFsError::NotADirectory(_) => Errno::ENOTDIR,
            UnionFsError::ReadOnlyFilesystem => Errno::EROFS,
            UnionFsError::BadHandle(_) => Errno::EBADF,
            UnionFsError::CorruptMetadata(_) => Errno::EIO,
            UnionFsError::Detached => Errno::EIO,
            UnionFsError::Io(err) => err
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
            UnionFsError::Custom(_) => Errno::EIO,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            UnionFsError::NotFound("etc/host".into()).errno(),
            Errno::ENOENT
        );
        assert_eq!(UnionFsError::ReadOnlyFilesystem.errno(), Errno::EROFS);
        assert_eq!(UnionFsError::BadHandle(7).errno(), Errno::EBADF);

        let io = UnionFsError::Io(io::Error::from_raw_os_error(Errno::ENOSPC as i32));
        assert_eq!(io.errno(), Errno::ENOSPC);
    }
}
