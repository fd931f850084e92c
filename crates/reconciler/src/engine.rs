//! Contract between the pipeline and the generic synchronization engine.

use tokio_util::sync::CancellationToken;

use crate::{MutationClient, SyncObject};

/// Per-call context handed to the engine and the deletion hook.
#[derive(Debug, Clone, Copy)]
pub struct SyncContext<'a> {
    pub cancel: &'a CancellationToken,
    pub kind: &'a str,
}

/// Everything the engine needs for one object.
#[derive(Clone, Copy)]
pub struct SyncRequest<'a> {
    pub object: &'a dyn SyncObject,
    pub client: &'a dyn MutationClient,
    pub after_deletion: &'a dyn AfterDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// Nothing failed, but the engine wants to see the key again later.
    Requeue,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transient(anyhow::Error),
    #[error(transparent)]
    Permanent(anyhow::Error),
}

impl SyncError {
    pub fn transient(e: impl Into<anyhow::Error>) -> Self { SyncError::Transient(e.into()) }
    pub fn permanent(e: impl Into<anyhow::Error>) -> Self { SyncError::Permanent(e.into()) }

    pub fn is_permanent(&self) -> bool { matches!(self, SyncError::Permanent(_)) }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            SyncError::Transient(e) | SyncError::Permanent(e) => e,
        }
    }
}

/// Mirrors one adapted object into the external store.
#[async_trait::async_trait]
pub trait SyncEngine: Send + Sync {
    async fn sync(&self, cx: &SyncContext<'_>, req: SyncRequest<'_>) -> Result<SyncOutcome, SyncError>;
}

/// Cleanup hook the engine runs when it finalizes an object's synchronized counterpart.
///
/// Called at most once per finalization attempt, after the engine decided the object is
/// gone upstream and before it releases its finalizer. The hook may do external I/O but
/// must not touch the cached snapshot. An error keeps the finalizer in place and the
/// engine reports a transient failure.
#[async_trait::async_trait]
pub trait AfterDeletion: Send + Sync {
    async fn after_deletion(&self, cx: &SyncContext<'_>, object: &dyn SyncObject) -> anyhow::Result<()>;
}

/// Default hook: nothing to clean up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAfterDeletion;

#[async_trait::async_trait]
impl AfterDeletion for NoopAfterDeletion {
    async fn after_deletion(&self, _cx: &SyncContext<'_>, _object: &dyn SyncObject) -> anyhow::Result<()> { Ok(()) }
}
