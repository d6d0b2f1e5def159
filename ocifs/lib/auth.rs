//! Registry credentials.

use std::collections::HashMap;

use getset::Getters;
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Basic credentials for a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Credentials {
    /// The user name.
    username: String,

    /// The password or token.
    password: String,
}

/// Maps `registry/repository` prefixes to credentials.
///
/// Resolution picks the longest matching prefix; resources without a match
/// are accessed anonymously.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    creds: HashMap<String, Credentials>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Credentials {
    /// Creates a credentials pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Keychain {
    /// Creates an empty keychain; all resources resolve anonymously.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers credentials for every resource starting with `prefix`
    /// (e.g. `"ghcr.io"` or `"docker.io/myorg"`).
    pub fn add(&mut self, prefix: impl Into<String>, credentials: Credentials) {
        self.creds.insert(prefix.into(), credentials);
    }

    /// Builder-style [`Keychain::add`].
    pub fn with_credentials(mut self, prefix: impl Into<String>, credentials: Credentials) -> Self {
        self.add(prefix, credentials);
        self
    }

    /// Resolves the credentials for a `registry/repository` resource.
    pub fn resolve(&self, resource: &str) -> Option<&Credentials> {
        self.creds
            .iter()
            .filter(|(prefix, _)| resource.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, credentials)| credentials)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
