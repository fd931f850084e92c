//! Rekord core types: resource identities, canonical conditions, the leadership gate
//! and the control signals handed back to the work-queue dispatcher.

#![forbid(unsafe_code)]

pub mod condition;
pub mod key;
pub mod leader;
pub mod signal;

pub use condition::{Condition, ConditionStatus, ConditionView, StatusConditionAccessor, SUCCEEDED};
pub use key::{split_key, KeyError, ResourceIdentity};
pub use leader::{AlwaysLeader, BucketGate, BucketPlanner, LeaderGate};
pub use signal::{ControlSignal, ReconcileError};

pub mod prelude {
    pub use super::{
        split_key, Condition, ConditionStatus, ConditionView, ControlSignal, LeaderGate, ReconcileError,
        ResourceIdentity, StatusConditionAccessor,
    };
}
