//! Rekord kubehub: kube client, typed watchers feeding the cache, and the
//! namespace-scoped mutation clients handed to the sync engine.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client, Resource, ResourceExt,
};
use metrics::counter;
use once_cell::sync::OnceCell;
use rekord_reconciler::{ClientBinder, MutationClient};
use rekord_store::Delta;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared client built from the ambient kubeconfig or in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    let _ = CLIENT.set(client.clone());
    Ok(client)
}

/// Api for a namespaced kind, optionally restricted to one namespace.
pub fn kind_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// List+watch `api` and forward every event as a [`Delta`]. Watch errors are retried
/// with backoff; returns when the stream ends or the receiver is gone.
pub async fn start_watcher<K>(api: Api<K>, delta_tx: mpsc::Sender<Delta<K>>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).into_owned();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    while let Some(ev) = stream.next().await {
        let delta = match ev {
            Ok(Event::Applied(o)) => Delta::Applied(Arc::new(o)),
            Ok(Event::Deleted(o)) => Delta::Deleted(Arc::new(o)),
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                Delta::Restarted(list.into_iter().map(Arc::new).collect())
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64, "kind" => kind.clone());
                warn!(kind = %kind, error = %e, "watch error; backing off");
                continue;
            }
        };
        if delta_tx.send(delta).await.is_err() {
            debug!(kind = %kind, "delta receiver dropped; stopping watcher");
            return Ok(());
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

fn annotations_patch(annotations: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::json!({ "metadata": { "annotations": annotations } })
}

/// A `resourceVersion` in the body turns the merge patch into a compare-and-swap: the
/// API server answers 409 Conflict if the object moved on.
fn finalizers_patch(resource_version: &str, finalizers: &[String]) -> serde_json::Value {
    serde_json::json!({ "metadata": { "resourceVersion": resource_version, "finalizers": finalizers } })
}

/// Mutation client over one namespace of kind `K`.
pub struct KubeMutationClient<K> {
    api: Api<K>,
}

impl<K> KubeMutationClient<K> {
    pub fn new(api: Api<K>) -> Self { Self { api } }
}

#[async_trait::async_trait]
impl<K> MutationClient for KubeMutationClient<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn merge_annotations(&self, name: &str, annotations: &BTreeMap<String, String>) -> Result<()> {
        let patch = annotations_patch(annotations);
        let obj = self
            .api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching annotations of {} '{}'", K::kind(&()), name))?;
        debug!(kind = %K::kind(&()), name = %name, rv = ?obj.resource_version(), "annotations merged");
        Ok(())
    }

    async fn set_finalizers(&self, name: &str, resource_version: &str, finalizers: &[String]) -> Result<()> {
        let patch = finalizers_patch(resource_version, finalizers);
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("updating finalizers of {} '{}' at resourceVersion {}", K::kind(&()), name, resource_version))?;
        debug!(kind = %K::kind(&()), name = %name, rv = %resource_version, count = finalizers.len(), "finalizers set");
        Ok(())
    }
}

/// Binds [`KubeMutationClient`]s to namespaces. Holds only the client; binding is free.
pub struct KubeClientBinder<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeClientBinder<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

impl<K> ClientBinder for KubeClientBinder<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn bind(&self, namespace: &str) -> Box<dyn MutationClient> {
        Box::new(KubeMutationClient::new(Api::<K>::namespaced(self.client.clone(), namespace)))
    }
}
