//! `ocifs` exposes an OCI container image as a live, browsable filesystem.
//!
//! Mounting a reference (`registry/repo:tag`) resolves it under a pull
//! policy, pulls and unpacks the image's layers into a content-addressed
//! work directory, flattens them into a union view with OCI whiteout
//! semantics, and serves the result as a file tree, optionally overlaid
//! with a writable layer providing copy-on-write.
//!
//! # Architecture
//!
//! - [`store`] - the layer store: reference bindings, content-addressed
//!   blobs, per-layer metadata, the OCI image layout and the puller
//! - [`distribution`] - the registry client boundary and its Docker
//!   Registry v2 implementation
//! - [`mount`] - the mount lifecycle and the kernel-adapter seam
//! - [`unionfs`] (sibling crate) - the flattened view and the file tree
//!
//! # Usage Example
//!
//! ```no_run
//! use ocifs::{MountOptions, OciFs};
//!
//! # async fn run() -> ocifs::OcifsResult<()> {
//! let ofs = OciFs::builder().work_dir("/var/lib/ocifs").build().await?;
//! let mount = ofs
//!     .mount("alpine:3.21", MountOptions::default())
//!     .await?;
//! println!("mounted at {}", mount.mount_point().display());
//! mount.wait().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod auth;
pub mod cancel;
pub mod distribution;
pub mod mount;
pub mod reference;
pub mod store;
pub mod utils;

pub use auth::{Credentials, Keychain};
pub use cancel::CancelToken;
pub use error::*;
pub use mount::{
    ImageMount, MountAdapter, MountHandle, MountOptions, NullAdapter, OciFs, OciFsBuilder,
};
pub use reference::Reference;
pub use store::PullPolicy;
