//! The reconciliation pipeline: key → leadership → cache → adapter → engine → signal.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rekord_core::{split_key, ControlSignal, LeaderGate, ReconcileError, ResourceIdentity};
use rekord_store::Lister;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::outcome::{translate, Stop};
use crate::{AfterDeletion, ClientBinder, NoopAfterDeletion, Reconcilable, SyncContext, SyncEngine, SyncOutcome, SyncRequest};

/// Reconciles one resource kind. Holds no per-call state; safe to share across workers.
pub struct Reconciler<K: Reconcilable> {
    kind: String,
    gate: Arc<dyn LeaderGate>,
    lister: Arc<dyn Lister<K>>,
    binder: Arc<dyn ClientBinder>,
    engine: Arc<dyn SyncEngine>,
    after_deletion: Arc<dyn AfterDeletion>,
}

impl<K: Reconcilable> Reconciler<K> {
    pub fn new(
        gate: Arc<dyn LeaderGate>,
        lister: Arc<dyn Lister<K>>,
        binder: Arc<dyn ClientBinder>,
        engine: Arc<dyn SyncEngine>,
    ) -> Self {
        Self { kind: K::kind(&()).into_owned(), gate, lister, binder, engine, after_deletion: Arc::new(NoopAfterDeletion) }
    }

    pub fn with_after_deletion(mut self, hook: Arc<dyn AfterDeletion>) -> Self {
        self.after_deletion = hook;
        self
    }

    pub fn kind(&self) -> &str { &self.kind }

    /// Reconcile the resource named by `key`. Cancelling `cancel` makes the cache read
    /// and the engine call return promptly with a retryable error.
    pub async fn reconcile(&self, cancel: &CancellationToken, key: &str) -> ControlSignal {
        let t0 = Instant::now();
        let signal = translate(key, self.run(cancel, key).await);
        counter!("reconcile_total", 1u64, "kind" => self.kind.clone(), "outcome" => signal.label());
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.clone());
        signal
    }

    async fn run(&self, cancel: &CancellationToken, key: &str) -> Result<SyncOutcome, Stop> {
        let id = match split_key(key) {
            Ok(id) => id,
            Err(e) => {
                error!(kind = %self.kind, key = %key, error = %e, "received invalid resource key, skipping reconciliation");
                return Err(Stop::Skip);
            }
        };

        if !self.gate.is_leader_for(&id) {
            debug!(kind = %self.kind, namespace = %id.namespace, name = %id.name, "not the leader, skipping reconciliation");
            return Err(Stop::Skip);
        }

        info!(kind = %self.kind, namespace = %id.namespace, name = %id.name, "initializing reconciliation");
        let obj = self.fetch(cancel, &id).await?;
        self.dispatch(cancel, &id, obj.as_ref()).await
    }

    async fn fetch(&self, cancel: &CancellationToken, id: &ResourceIdentity) -> Result<Arc<K>, Stop> {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled(id)),
            res = self.lister.get(id) => res,
        };
        match res {
            Ok(obj) => Ok(obj),
            Err(e) if e.is_not_found() => {
                debug!(kind = %self.kind, namespace = %id.namespace, name = %id.name, "no longer available, skipping reconciliation");
                Err(Stop::Skip)
            }
            Err(e) => Err(Stop::Fail(ReconcileError::Retrieval { kind: self.kind.clone(), identity: id.clone(), source: e.into() })),
        }
    }

    async fn dispatch(&self, cancel: &CancellationToken, id: &ResourceIdentity, obj: &K) -> Result<SyncOutcome, Stop> {
        let adapted = obj.adapt();
        let client = self.binder.bind(&id.namespace);
        let cx = SyncContext { cancel, kind: &self.kind };
        let req = SyncRequest { object: &adapted, client: client.as_ref(), after_deletion: self.after_deletion.as_ref() };
        let span = info_span!("sync", kind = %self.kind, namespace = %id.namespace, name = %id.name);

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.cancelled(id)),
            res = self.engine.sync(&cx, req).instrument(span) => res,
        };
        res.map_err(|e| {
            Stop::Fail(ReconcileError::Delegate {
                kind: self.kind.clone(),
                identity: id.clone(),
                permanent: e.is_permanent(),
                source: e.into_inner(),
            })
        })
    }

    fn cancelled(&self, id: &ResourceIdentity) -> Stop {
        Stop::Fail(ReconcileError::Cancelled { kind: self.kind.clone(), identity: id.clone() })
    }
}
