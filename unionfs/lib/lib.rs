//! `unionfs` flattens the layer stack of an OCI image into a single live file
//! tree and serves POSIX-shaped operations over it.
//!
//! The crate has three moving parts:
//!
//! - [`unify`] folds an ordered list of read-only layers into one sorted,
//!   whiteout-free list of entries, honouring the OCI `.wh.` and
//!   `.wh..wh..opq` conventions.
//! - [`WritableLayer`] is an optional upper layer: an in-memory metadata map
//!   persisted to `metadata.json` plus a `content/` directory holding file
//!   bodies, giving the mount copy-on-write semantics.
//! - [`UnionFs`] merges the two on every lookup and exposes directory, file
//!   and symlink nodes with the operations a kernel filesystem adapter needs
//!   (lookup, readdir, open, read, write, create, mkdir, unlink, release,
//!   getattr).
//!
//! The crate knows nothing about registries or how layers are fetched; it
//! consumes [`Entry`] lists whose regular files point at content-addressed
//! blobs on disk.

#![warn(missing_docs)]

mod entry;
mod error;
mod path;
mod tree;
mod unify;
mod writable;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use entry::*;
pub use error::*;
pub use path::*;
pub use tree::*;
pub use unify::*;
pub use writable::*;
