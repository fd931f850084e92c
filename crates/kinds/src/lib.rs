//! Rekord resource kinds.
//!
//! Each kind keeps its own native condition schema and supplies a thin borrowing adapter
//! that projects it onto [`rekord_core::Condition`] and [`rekord_reconciler::SyncObject`].

#![forbid(unsafe_code)]

pub mod buildrun;
pub mod knative;
pub mod pipelinerun;
pub mod taskrun;

pub use buildrun::{BuildRun, BuildRunAdapter, BuildRunCondition, BuildRunSpec, BuildRunStatus};
pub use knative::KnativeCondition;
pub use pipelinerun::{PipelineRun, PipelineRunAdapter, PipelineRunSpec, PipelineRunStatus};
pub use taskrun::{TaskRun, TaskRunAdapter, TaskRunSpec, TaskRunStatus};
