//! Narrow mutation surface the sync engine uses for bookkeeping on the live resource.

use std::collections::BTreeMap;

use anyhow::Result;

/// Mutations against one namespace of one resource kind.
#[async_trait::async_trait]
pub trait MutationClient: Send + Sync {
    /// Merge the given annotations into `metadata.annotations`.
    async fn merge_annotations(&self, name: &str, annotations: &BTreeMap<String, String>) -> Result<()>;

    /// Replace `metadata.finalizers` with exactly `finalizers`, provided the live object is
    /// still at `resource_version`. A newer object makes the call fail with a conflict, so
    /// a list computed from a stale snapshot never overwrites somebody else's finalizers.
    async fn set_finalizers(&self, name: &str, resource_version: &str, finalizers: &[String]) -> Result<()>;
}

/// Produces namespace-scoped mutation clients. Binding performs no I/O; errors only
/// surface when the bound client is used.
pub trait ClientBinder: Send + Sync {
    fn bind(&self, namespace: &str) -> Box<dyn MutationClient>;
}
