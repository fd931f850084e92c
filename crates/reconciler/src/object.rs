//! The shape the sync engine sees, independent of the concrete resource kind.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use rekord_core::{ResourceIdentity, StatusConditionAccessor};

/// An adapted resource snapshot.
///
/// Implementations borrow the cached snapshot and only project from it; nothing here
/// may mutate the object.
pub trait SyncObject: StatusConditionAccessor + Send + Sync {
    fn kind(&self) -> &str;
    fn api_version(&self) -> &str;
    fn meta(&self) -> &ObjectMeta;
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;

    fn identity(&self) -> ResourceIdentity {
        let meta = self.meta();
        ResourceIdentity::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
    }

    fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or_default() }
    fn uid(&self) -> Option<&str> { self.meta().uid.as_deref() }
    fn resource_version(&self) -> Option<&str> { self.meta().resource_version.as_deref() }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().annotations.as_ref()?.get(key).map(String::as_str)
    }

    fn finalizers(&self) -> &[String] { self.meta().finalizers.as_deref().unwrap_or_default() }
    fn has_finalizer(&self, finalizer: &str) -> bool { self.finalizers().iter().any(|f| f == finalizer) }
    fn is_deleting(&self) -> bool { self.meta().deletion_timestamp.is_some() }
}

/// A resource kind the pipeline can reconcile: every kind supplies its own adapter.
pub trait Reconcilable: Resource<DynamicType = ()> + Send + Sync + 'static {
    type Adapter<'a>: SyncObject
    where
        Self: 'a;

    fn adapt(&self) -> Self::Adapter<'_>;
}
