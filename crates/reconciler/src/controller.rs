//! Worker pool draining a [`WorkQueue`] into a [`Reconciler`].

use std::sync::Arc;

use rekord_core::ControlSignal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{BackoffConfig, Reconcilable, Reconciler, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub workers: usize,
    pub backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self { Self { workers: 2, backoff: BackoffConfig::default() } }
}

pub struct Controller<K: Reconcilable> {
    reconciler: Arc<Reconciler<K>>,
    queue: WorkQueue,
    workers: usize,
}

impl<K: Reconcilable> Controller<K> {
    pub fn new(reconciler: Reconciler<K>, cfg: ControllerConfig) -> Self {
        Self { reconciler: Arc::new(reconciler), queue: WorkQueue::new(cfg.backoff), workers: cfg.workers.max(1) }
    }

    /// Handle for enqueuing keys, e.g. from the cache's notification channel.
    pub fn queue(&self) -> WorkQueue { self.queue.clone() }

    /// Run workers until `shutdown` is cancelled. In-flight reconciles observe the same
    /// token and return promptly.
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = self.reconciler.kind().to_string();
        info!(kind = %kind, workers = self.workers, "controller starting");
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = self.queue.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    let signal = reconciler.reconcile(&token, &key).await;
                    handle_signal(&queue, reconciler.kind(), &key, signal);
                    queue.done(&key);
                }
                debug!(worker, "worker stopped");
            }));
        }

        shutdown.cancelled().await;
        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                warn!(kind = %kind, error = %e, "worker task failed");
            }
        }
        info!(kind = %kind, "controller stopped");
    }
}

/// Queue policy for one signal.
pub fn handle_signal(queue: &WorkQueue, kind: &str, key: &str, signal: ControlSignal) {
    match signal {
        ControlSignal::Done | ControlSignal::SkipKey(_) => queue.forget(key),
        ControlSignal::Requeue(k) => queue.add_rate_limited(&k),
        ControlSignal::Error(e) if e.is_permanent() => {
            error!(kind = %kind, key = %key, error = %format!("{:#}", anyhow::Error::from(e)), "permanent reconcile error, dropping key");
            queue.forget(key);
        }
        ControlSignal::Error(e) => {
            error!(kind = %kind, key = %key, error = %format!("{:#}", anyhow::Error::from(e)), "reconcile failed, will retry");
            queue.add_rate_limited(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekord_core::{ReconcileError, ResourceIdentity};

    #[tokio::test]
    async fn signals_drive_queue_policy() {
        let q = WorkQueue::new(BackoffConfig::default());
        let id = ResourceIdentity::new("ns", "a");

        handle_signal(&q, "TaskRun", "ns/a", ControlSignal::Error(ReconcileError::Cancelled { kind: "TaskRun".into(), identity: id.clone() }));
        assert_eq!(q.failures("ns/a"), 1);

        handle_signal(&q, "TaskRun", "ns/a", ControlSignal::Done);
        assert_eq!(q.failures("ns/a"), 0);

        let permanent = ReconcileError::Delegate { kind: "TaskRun".into(), identity: id, permanent: true, source: anyhow::anyhow!("bad") };
        handle_signal(&q, "TaskRun", "ns/a", ControlSignal::Error(permanent));
        assert_eq!(q.failures("ns/a"), 0);

        handle_signal(&q, "TaskRun", "ns/b", ControlSignal::Requeue("ns/b".into()));
        assert_eq!(q.failures("ns/b"), 1);
        handle_signal(&q, "TaskRun", "ns/b", ControlSignal::SkipKey("ns/b".into()));
        assert_eq!(q.failures("ns/b"), 0);
    }
}
