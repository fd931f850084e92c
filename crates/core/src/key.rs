//! Work-item keys and the identities they carry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespaced identity of a resource, derived from a `"<namespace>/<name>"` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Render back into the work-item key form.
    pub fn key(&self) -> String { format!("{}/{}", self.namespace, self.name) }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid resource key {0:?}: expected <namespace>/<name>")]
    Malformed(String),
}

/// Split a work-item key into its namespace and name.
///
/// Every kind handled here is namespaced, so a bare `"name"` is as malformed as
/// `"a/b/c"` or a key with an empty segment.
pub fn split_key(key: &str) -> Result<ResourceIdentity, KeyError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => Ok(ResourceIdentity::new(ns, name)),
        _ => Err(KeyError::Malformed(key.to_string())),
    }
}

impl std::str::FromStr for ResourceIdentity {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { split_key(s) }
}
