//! Sync engine that mirrors runs into the record store.
//!
//! Per object: upsert the record (skipped when the resourceVersion is unchanged), then do
//! the bookkeeping on the live resource through the bound mutation client: hold or release
//! the finalizer and stamp the stored annotation once the run reached a terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rekord_core::SUCCEEDED;
use rekord_reconciler::{SyncContext, SyncEngine, SyncError, SyncObject, SyncOutcome, SyncRequest};
use tracing::{debug, info};

use crate::{is_busy, maybe_compress, now_ts, Record, RecordStore, Upsert};

pub const FINALIZER: &str = "results.rekord.dev/store";
pub const STORED_ANNOTATION: &str = "results.rekord.dev/stored";

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// Hold [`FINALIZER`] on live resources so deletion waits for the cleanup hook.
    pub finalizer: bool,
}

pub struct RecordEngine {
    store: Arc<dyn RecordStore>,
    cfg: EngineConfig,
}

impl RecordEngine {
    pub fn new(store: Arc<dyn RecordStore>, cfg: EngineConfig) -> Self { Self { store, cfg } }

    async fn upsert(&self, rec: Record) -> Result<Upsert, SyncError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.upsert(&rec))
            .await
            .map_err(|e| SyncError::transient(anyhow!("record store task failed: {e}")))?
            .map_err(SyncError::Transient)
    }

    async fn finalize(&self, cx: &SyncContext<'_>, req: SyncRequest<'_>) -> Result<SyncOutcome, SyncError> {
        let obj = req.object;
        let rv = observed_version(obj)?;
        req.after_deletion
            .after_deletion(cx, obj)
            .await
            .context("deletion hook failed; keeping finalizer")
            .map_err(SyncError::Transient)?;
        let remaining: Vec<String> = obj.finalizers().iter().filter(|f| *f != FINALIZER).cloned().collect();
        req.client.set_finalizers(obj.name(), rv, &remaining).await.map_err(SyncError::Transient)?;
        info!(kind = %cx.kind, key = %obj.identity(), "finalizer released");
        Ok(SyncOutcome::Synced)
    }
}

/// Finalizer updates are conditional on the snapshot's resourceVersion; without one the
/// list can't be written safely.
fn observed_version(obj: &dyn SyncObject) -> Result<&str, SyncError> {
    obj.resource_version()
        .filter(|rv| !rv.is_empty())
        .ok_or_else(|| SyncError::permanent(anyhow!("{} has no resourceVersion", obj.identity())))
}

/// Project an adapted object onto its record row.
pub(crate) fn project(obj: &dyn SyncObject) -> Result<Record, SyncError> {
    let uid = obj.uid().ok_or_else(|| SyncError::permanent(anyhow!("{} has no uid", obj.identity())))?;
    let uid = uuid::Uuid::parse_str(uid)
        .with_context(|| format!("{} has a malformed uid '{}'", obj.identity(), uid))
        .map_err(SyncError::Permanent)?;
    let json = obj.to_json().context("serializing object").map_err(SyncError::Permanent)?;
    let succeeded = obj.status_conditions().condition(SUCCEEDED);
    let id = obj.identity();
    Ok(Record {
        uid: *uid.as_bytes(),
        kind: obj.kind().to_string(),
        namespace: id.namespace,
        name: id.name,
        resource_version: obj.resource_version().unwrap_or_default().to_string(),
        status: succeeded.as_ref().map(|c| c.status.as_str().to_string()),
        reason: succeeded.as_ref().map(|c| c.reason.clone()).unwrap_or_default(),
        message: succeeded.as_ref().map(|c| c.message.clone()).unwrap_or_default(),
        transition_ts: succeeded.as_ref().and_then(|c| c.last_transition_time).map(|t| t.timestamp()),
        data: maybe_compress(&json.to_string()),
        updated_ts: now_ts(),
    })
}

#[async_trait::async_trait]
impl SyncEngine for RecordEngine {
    async fn sync(&self, cx: &SyncContext<'_>, req: SyncRequest<'_>) -> Result<SyncOutcome, SyncError> {
        let obj = req.object;
        let key = obj.identity();
        let rec = project(obj)?;
        let terminal = matches!(rec.status.as_deref(), Some("True") | Some("False"));

        match self.upsert(rec).await {
            Ok(Upsert::Written) => debug!(kind = %cx.kind, key = %key, "record written"),
            Ok(Upsert::Unchanged) => debug!(kind = %cx.kind, key = %key, "record unchanged"),
            Err(SyncError::Transient(e)) if is_busy(&e) => {
                debug!(kind = %cx.kind, key = %key, error = %e, "record store busy; requeueing");
                return Ok(SyncOutcome::Requeue);
            }
            Err(e) => return Err(e),
        }

        if obj.is_deleting() {
            if obj.has_finalizer(FINALIZER) {
                return self.finalize(cx, req).await;
            }
            return Ok(SyncOutcome::Synced);
        }

        if self.cfg.finalizer && !obj.has_finalizer(FINALIZER) {
            let mut finalizers = obj.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            req.client
                .set_finalizers(obj.name(), observed_version(obj)?, &finalizers)
                .await
                .map_err(SyncError::Transient)?;
            debug!(kind = %cx.kind, key = %key, "finalizer added");
        }

        if terminal && obj.annotation(STORED_ANNOTATION).is_none() {
            let ann = BTreeMap::from([(STORED_ANNOTATION.to_string(), "true".to_string())]);
            req.client.merge_annotations(obj.name(), &ann).await.map_err(SyncError::Transient)?;
            info!(kind = %cx.kind, key = %key, "run stored");
        }
        Ok(SyncOutcome::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{temp_db, SqliteStore};
    use rekord_kinds::BuildRun;
    use rekord_reconciler::{AfterDeletion, MutationClient, NoopAfterDeletion, Reconcilable};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    const UID: &str = "6f1b7a52-3f0e-4c43-9a57-2a4c1d0b9e11";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Annotate(String, BTreeMap<String, String>),
        Finalizers(String, String, Vec<String>),
    }

    #[derive(Default)]
    struct FakeClient {
        calls: Mutex<Vec<Call>>,
        /// Fail finalizer updates the way the API server does for a stale resourceVersion.
        conflict: bool,
    }

    impl FakeClient {
        fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }
    }

    #[async_trait::async_trait]
    impl MutationClient for FakeClient {
        async fn merge_annotations(&self, name: &str, annotations: &BTreeMap<String, String>) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Annotate(name.into(), annotations.clone()));
            Ok(())
        }
        async fn set_finalizers(&self, name: &str, resource_version: &str, finalizers: &[String]) -> anyhow::Result<()> {
            if self.conflict {
                anyhow::bail!("Operation cannot be fulfilled on buildruns.shipwright.io \"{}\": the object has been modified", name);
            }
            self.calls.lock().unwrap().push(Call::Finalizers(name.into(), resource_version.into(), finalizers.to_vec()));
            Ok(())
        }
    }

    struct Hook {
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl AfterDeletion for Hook {
        async fn after_deletion(&self, _cx: &SyncContext<'_>, object: &dyn SyncObject) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(object.identity().key());
            if self.fail {
                anyhow::bail!("archive unavailable");
            }
            Ok(())
        }
    }

    fn build_run(rv: &str, status: &str, metadata: serde_json::Value) -> BuildRun {
        let mut meta = serde_json::json!({ "name": "my-run", "namespace": "build", "uid": UID, "resourceVersion": rv });
        if let (Some(m), Some(extra)) = (meta.as_object_mut(), metadata.as_object()) {
            m.extend(extra.clone());
        }
        serde_json::from_value(serde_json::json!({
            "apiVersion": "shipwright.io/v1beta1",
            "kind": "BuildRun",
            "metadata": meta,
            "spec": { "build": { "name": "app" } },
            "status": { "conditions": [{
                "type": "Succeeded", "status": status, "reason": "Done", "message": "all steps ok",
                "lastTransitionTime": "2024-05-01T12:00:00Z"
            }] }
        }))
        .unwrap()
    }

    fn store() -> Arc<SqliteStore> { Arc::new(SqliteStore::open(&temp_db()).unwrap()) }

    async fn sync_once(
        engine: &RecordEngine,
        run: &BuildRun,
        client: &FakeClient,
        hook: &dyn AfterDeletion,
    ) -> Result<SyncOutcome, SyncError> {
        let cancel = CancellationToken::new();
        let cx = SyncContext { cancel: &cancel, kind: "BuildRun" };
        let adapted = run.adapt();
        engine.sync(&cx, SyncRequest { object: &adapted, client, after_deletion: hook }).await
    }

    fn uid_bytes() -> [u8; 16] { *uuid::Uuid::parse_str(UID).unwrap().as_bytes() }

    #[tokio::test]
    async fn stores_condition_projection() {
        let s = store();
        let engine = RecordEngine::new(s.clone(), EngineConfig::default());
        let client = FakeClient::default();
        let out = sync_once(&engine, &build_run("5", "Unknown", serde_json::json!({})), &client, &NoopAfterDeletion).await;
        assert_eq!(out.unwrap(), SyncOutcome::Synced);

        let rec = s.get(uid_bytes()).unwrap().unwrap();
        assert_eq!(rec.kind, "BuildRun");
        assert_eq!((rec.namespace.as_str(), rec.name.as_str()), ("build", "my-run"));
        assert_eq!(rec.status.as_deref(), Some("Unknown"));
        assert_eq!(rec.reason, "Done");
        assert_eq!(rec.message, "all steps ok");
        assert_eq!(rec.transition_ts, Some(1_714_564_800));
        assert_eq!(rec.json().unwrap()["spec"]["build"]["name"], "app");
        // Still running: no bookkeeping on the live object.
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn unchanged_resource_version_keeps_row() {
        let s = store();
        let engine = RecordEngine::new(s.clone(), EngineConfig::default());
        let client = FakeClient::default();
        sync_once(&engine, &build_run("5", "Unknown", serde_json::json!({})), &client, &NoopAfterDeletion).await.unwrap();
        let first = s.get(uid_bytes()).unwrap().unwrap();
        sync_once(&engine, &build_run("5", "Unknown", serde_json::json!({})), &client, &NoopAfterDeletion).await.unwrap();
        assert_eq!(s.get(uid_bytes()).unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn terminal_run_is_annotated_once() {
        let engine = RecordEngine::new(store(), EngineConfig::default());
        let client = FakeClient::default();
        sync_once(&engine, &build_run("6", "True", serde_json::json!({})), &client, &NoopAfterDeletion).await.unwrap();
        let expected = BTreeMap::from([(STORED_ANNOTATION.to_string(), "true".to_string())]);
        assert_eq!(client.calls(), vec![Call::Annotate("my-run".into(), expected)]);

        let annotated = build_run("7", "True", serde_json::json!({ "annotations": { STORED_ANNOTATION: "true" } }));
        sync_once(&engine, &annotated, &client, &NoopAfterDeletion).await.unwrap();
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn finalizer_is_added_when_enabled() {
        let engine = RecordEngine::new(store(), EngineConfig { finalizer: true });
        let client = FakeClient::default();
        let run = build_run("5", "Unknown", serde_json::json!({ "finalizers": ["other.io/keep"] }));
        sync_once(&engine, &run, &client, &NoopAfterDeletion).await.unwrap();
        assert_eq!(
            client.calls(),
            vec![Call::Finalizers("my-run".into(), "5".into(), vec!["other.io/keep".into(), FINALIZER.into()])]
        );
    }

    #[tokio::test]
    async fn deletion_runs_hook_then_releases_finalizer() {
        let engine = RecordEngine::new(store(), EngineConfig { finalizer: true });
        let client = FakeClient::default();
        let hook = Hook { fail: false, seen: Mutex::new(Vec::new()) };
        let run = build_run(
            "9",
            "False",
            serde_json::json!({ "deletionTimestamp": "2024-05-02T00:00:00Z", "finalizers": [FINALIZER, "other.io/keep"] }),
        );
        let out = sync_once(&engine, &run, &client, &hook).await.unwrap();
        assert_eq!(out, SyncOutcome::Synced);
        assert_eq!(*hook.seen.lock().unwrap(), vec!["build/my-run".to_string()]);
        assert_eq!(client.calls(), vec![Call::Finalizers("my-run".into(), "9".into(), vec!["other.io/keep".into()])]);
    }

    #[tokio::test]
    async fn stale_snapshot_conflict_keeps_finalizers_and_retries() {
        let engine = RecordEngine::new(store(), EngineConfig { finalizer: true });
        let client = FakeClient { conflict: true, ..Default::default() };
        let hook = Hook { fail: false, seen: Mutex::new(Vec::new()) };
        let run = build_run(
            "9",
            "True",
            serde_json::json!({ "deletionTimestamp": "2024-05-02T00:00:00Z", "finalizers": [FINALIZER] }),
        );
        let err = sync_once(&engine, &run, &client, &hook).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(format!("{:#}", err.into_inner()).contains("the object has been modified"));
        assert_eq!(hook.seen.lock().unwrap().len(), 1);
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn finalizer_update_needs_a_resource_version() {
        let engine = RecordEngine::new(store(), EngineConfig { finalizer: true });
        let client = FakeClient::default();
        let mut run = build_run("1", "Unknown", serde_json::json!({}));
        run.metadata.resource_version = None;
        assert!(sync_once(&engine, &run, &client, &NoopAfterDeletion).await.unwrap_err().is_permanent());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn failing_hook_keeps_finalizer() {
        let engine = RecordEngine::new(store(), EngineConfig { finalizer: true });
        let client = FakeClient::default();
        let hook = Hook { fail: true, seen: Mutex::new(Vec::new()) };
        let run = build_run("9", "True", serde_json::json!({ "deletionTimestamp": "2024-05-02T00:00:00Z", "finalizers": [FINALIZER] }));
        let err = sync_once(&engine, &run, &client, &hook).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn deletion_without_our_finalizer_skips_hook() {
        let engine = RecordEngine::new(store(), EngineConfig::default());
        let client = FakeClient::default();
        let hook = Hook { fail: true, seen: Mutex::new(Vec::new()) };
        let run = build_run("9", "True", serde_json::json!({ "deletionTimestamp": "2024-05-02T00:00:00Z" }));
        assert_eq!(sync_once(&engine, &run, &client, &hook).await.unwrap(), SyncOutcome::Synced);
        assert!(hook.seen.lock().unwrap().is_empty());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_uid_is_permanent() {
        let engine = RecordEngine::new(store(), EngineConfig::default());
        let client = FakeClient::default();
        let mut run = build_run("1", "True", serde_json::json!({}));
        run.metadata.uid = None;
        assert!(sync_once(&engine, &run, &client, &NoopAfterDeletion).await.unwrap_err().is_permanent());
        run.metadata.uid = Some("not-a-uuid".into());
        assert!(sync_once(&engine, &run, &client, &NoopAfterDeletion).await.unwrap_err().is_permanent());
    }

    struct BusyStore;

    impl RecordStore for BusyStore {
        fn upsert(&self, _rec: &Record) -> anyhow::Result<Upsert> {
            let e = rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error { code: rusqlite::ErrorCode::DatabaseBusy, extended_code: 5 },
                None,
            );
            Err(anyhow::Error::new(e).context("upserting record"))
        }
        fn get(&self, _uid: [u8; 16]) -> anyhow::Result<Option<Record>> { Ok(None) }
        fn delete(&self, _uid: [u8; 16]) -> anyhow::Result<bool> { Ok(false) }
    }

    #[tokio::test]
    async fn busy_store_requeues() {
        let engine = RecordEngine::new(Arc::new(BusyStore), EngineConfig { finalizer: true });
        let client = FakeClient::default();
        let out = sync_once(&engine, &build_run("1", "True", serde_json::json!({})), &client, &NoopAfterDeletion).await;
        assert_eq!(out.unwrap(), SyncOutcome::Requeue);
        assert!(client.calls().is_empty());
    }
}
