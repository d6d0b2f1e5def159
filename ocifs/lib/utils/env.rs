//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The environment variable overriding the default registry for references
/// that do not name one.
pub const OCIFS_REGISTRY_ENV_VAR: &str = "OCIFS_REGISTRY";

/// The registry assumed when a reference names none and the environment does
/// not override it.
pub const DEFAULT_REGISTRY: &str = "docker.io";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the registry to assume for references that do not name one.
pub fn default_registry() -> String {
    std::env::var(OCIFS_REGISTRY_ENV_VAR).unwrap_or_else(|_| DEFAULT_REGISTRY.to_string())
}
