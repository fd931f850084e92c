//! Reconciliation outcomes as seen by the work-queue dispatcher.

use crate::ResourceIdentity;

/// Failures that leave the pipeline as errors. Malformed keys, non-owned identities and
/// vanished resources never show up here: those resolve to [`ControlSignal::SkipKey`].
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("error retrieving {kind} '{identity}' from cache")]
    Retrieval {
        kind: String,
        identity: ResourceIdentity,
        #[source]
        source: anyhow::Error,
    },
    #[error("error syncing {kind} '{identity}'")]
    Delegate {
        kind: String,
        identity: ResourceIdentity,
        permanent: bool,
        #[source]
        source: anyhow::Error,
    },
    #[error("reconciliation of {kind} '{identity}' was cancelled")]
    Cancelled { kind: String, identity: ResourceIdentity },
}

impl ReconcileError {
    pub fn kind(&self) -> &str {
        match self {
            ReconcileError::Retrieval { kind, .. }
            | ReconcileError::Delegate { kind, .. }
            | ReconcileError::Cancelled { kind, .. } => kind,
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        match self {
            ReconcileError::Retrieval { identity, .. }
            | ReconcileError::Delegate { identity, .. }
            | ReconcileError::Cancelled { identity, .. } => identity,
        }
    }

    /// Permanent errors are reported once and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ReconcileError::Delegate { permanent: true, .. })
    }
}

/// Exactly one of these is produced per reconcile call.
#[derive(Debug)]
pub enum ControlSignal {
    /// Work finished; forget any backoff state for the key.
    Done,
    /// Transient; try the key again later.
    Requeue(String),
    /// Nothing to do for this key now (malformed, not owned, or gone). Not a failure.
    SkipKey(String),
    /// Surface to the dispatcher's logging and backoff policy.
    Error(ReconcileError),
}

impl ControlSignal {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ControlSignal::Done => "done",
            ControlSignal::Requeue(_) => "requeue",
            ControlSignal::SkipKey(_) => "skip",
            ControlSignal::Error(e) if e.is_permanent() => "permanent_error",
            ControlSignal::Error(_) => "error",
        }
    }

    pub fn is_skip(&self) -> bool { matches!(self, ControlSignal::SkipKey(_)) }
}
