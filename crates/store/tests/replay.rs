#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rekord_core::ResourceIdentity;
use rekord_store::{spawn_ingest, CacheBuilder, Coalescer, Delta, Lister, LookupError};
use tokio::sync::mpsc;

fn obj(ns: &str, name: &str, rv: &str) -> Arc<ConfigMap> {
    Arc::new(ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    })
}

fn rv(o: &ConfigMap) -> &str { o.metadata.resource_version.as_deref().unwrap_or("") }

#[test]
fn coalescer_keeps_last_delta_per_key_in_fifo_order() {
    let mut c = Coalescer::with_capacity(8);
    c.push(Delta::Applied(obj("ns", "a", "1")));
    c.push(Delta::Applied(obj("ns", "b", "1")));
    c.push(Delta::Applied(obj("ns", "a", "2")));
    assert_eq!(c.len(), 2);
    let batch = c.drain_ready();
    assert!(batch.reset.is_none());
    assert_eq!(batch.deltas.len(), 2);
    match &batch.deltas[0] {
        Delta::Applied(o) => { assert_eq!(o.metadata.name.as_deref(), Some("a")); assert_eq!(rv(o), "2"); }
        other => panic!("unexpected {:?}", other),
    }
    assert!(c.is_empty());
}

#[test]
fn coalescer_drops_oldest_when_full() {
    let mut c = Coalescer::with_capacity(2);
    c.push(Delta::Applied(obj("ns", "a", "1")));
    c.push(Delta::Applied(obj("ns", "b", "1")));
    c.push(Delta::Applied(obj("ns", "c", "1")));
    assert_eq!(c.dropped(), 1);
    let names: Vec<_> = c
        .drain_ready()
        .deltas
        .iter()
        .map(|d| match d { Delta::Applied(o) => o.metadata.name.clone().unwrap_or_default(), _ => String::new() })
        .collect();
    assert_eq!(names, vec!["b", "c"]);
}

#[test]
fn relist_replaces_items_and_reports_vanished_keys() {
    let mut b = CacheBuilder::new();
    let mut c = Coalescer::with_capacity(16);
    c.push(Delta::Restarted(vec![obj("ns", "a", "1"), obj("ns", "b", "1")]));
    let touched = b.apply(c.drain_ready());
    assert_eq!(touched.len(), 2);
    let snap = b.freeze();
    assert!(snap.synced);
    assert_eq!(snap.len(), 2);

    // Pending deltas before a relist are superseded by it.
    c.push(Delta::Deleted(obj("ns", "a", "1")));
    c.push(Delta::Restarted(vec![obj("ns", "b", "2"), obj("other", "c", "1")]));
    c.push(Delta::Applied(obj("other", "d", "1")));
    let mut touched = b.apply(c.drain_ready());
    touched.sort();
    assert_eq!(touched, vec!["ns/a", "ns/b", "other/c", "other/d"]);
    let snap = b.freeze();
    assert_eq!(snap.epoch, 2);
    assert!(snap.get("ns/a").is_none());
    assert_eq!(rv(snap.get("ns/b").unwrap()), "2");
    assert_eq!(snap.len(), 3);
}

#[tokio::test]
async fn ingest_publishes_snapshots_and_notifies_keys() {
    let (keys_tx, mut keys_rx) = mpsc::unbounded_channel();
    let (tx, cache) = spawn_ingest::<ConfigMap>(64, keys_tx);
    let id = ResourceIdentity::new("build", "my-run");

    assert!(matches!(cache.get(&id).await, Err(LookupError::NotSynced)));

    tx.send(Delta::Restarted(vec![obj("build", "my-run", "1")])).await.unwrap();
    assert!(cache.wait_synced().await);
    assert_eq!(keys_rx.recv().await.as_deref(), Some("build/my-run"));
    assert_eq!(rv(&cache.get(&id).await.unwrap()), "1");

    tx.send(Delta::Deleted(obj("build", "my-run", "2"))).await.unwrap();
    assert_eq!(keys_rx.recv().await.as_deref(), Some("build/my-run"));
    match cache.get(&id).await {
        Err(LookupError::NotFound(missing)) => assert_eq!(missing, id),
        other => panic!("expected not found, got {:?}", other.map(|o| rv(&o).to_string())),
    }

    drop(tx);
    let mut epochs = cache.subscribe_epoch();
    while !cache.current().closed {
        if epochs.changed().await.is_err() { break; }
    }
    assert!(cache.current().closed);
    assert!(matches!(cache.get(&id).await, Err(LookupError::Closed)));
}

#[test]
fn lookup_errors_render_their_cause_once() {
    let err = LookupError::Unavailable(anyhow::anyhow!("informer cache offline"));
    assert_eq!(err.to_string(), "cache unavailable");
    assert_eq!(format!("{:#}", anyhow::Error::from(err)), "cache unavailable: informer cache offline");
}
