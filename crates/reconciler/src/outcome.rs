//! Terminal pipeline states and their translation into control signals.

use rekord_core::{ControlSignal, ReconcileError};

use crate::SyncOutcome;

/// Why the pipeline stopped before (or instead of) a successful sync.
#[derive(Debug)]
pub(crate) enum Stop {
    Skip,
    Fail(ReconcileError),
}

/// Map the first short-circuit (or the engine's answer) to exactly one signal.
pub(crate) fn translate(key: &str, res: Result<SyncOutcome, Stop>) -> ControlSignal {
    match res {
        Ok(SyncOutcome::Synced) => ControlSignal::Done,
        Ok(SyncOutcome::Requeue) => ControlSignal::Requeue(key.to_string()),
        Err(Stop::Skip) => ControlSignal::SkipKey(key.to_string()),
        Err(Stop::Fail(e)) => ControlSignal::Error(e),
    }
}
