use std::path::PathBuf;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory where reference → digest bindings are stored.
pub const REFS_SUBDIR: &str = "refs";

/// The sub directory where content-addressed blobs (file bodies and layer
/// bodies alike) are stored.
pub const BLOBS_SUBDIR: &str = "blobs";

/// The sub directory holding the OCI image layout (index, manifests,
/// configs).
pub const OCI_SUBDIR: &str = "oci";

/// The sub directory where auto-created mount points live.
pub const MOUNTS_SUBDIR: &str = "mounts";

/// The extension of per-layer metadata files, next to the layer blob.
pub const LAYER_META_EXTENSION: &str = "meta";

/// The OCI layout marker file name.
pub const OCI_LAYOUT_FILENAME: &str = "oci-layout";

/// The OCI layout index file name.
pub const OCI_INDEX_FILENAME: &str = "index.json";

/// The name of the default work directory under the system temp dir.
pub const DEFAULT_WORK_DIR_NAME: &str = "ocifs";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the work directory used when the caller does not supply one.
pub fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_WORK_DIR_NAME)
}
