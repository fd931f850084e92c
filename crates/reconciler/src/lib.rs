//! Rekord reconciler: the leader-aware reconciliation pipeline and its seams.
//!
//! A [`Reconciler`] takes a work-item key, checks leadership, reads the cached object,
//! adapts it behind [`SyncObject`], binds a namespaced [`MutationClient`] and hands
//! everything to a [`SyncEngine`]. The [`Controller`] drives reconcilers from a
//! [`WorkQueue`] and applies the retry policy for each [`rekord_core::ControlSignal`].

#![forbid(unsafe_code)]

mod client;
mod controller;
mod engine;
mod object;
mod outcome;
mod queue;
mod reconcile;

pub use client::{ClientBinder, MutationClient};
pub use controller::{handle_signal, Controller, ControllerConfig};
pub use engine::{AfterDeletion, NoopAfterDeletion, SyncContext, SyncEngine, SyncError, SyncOutcome, SyncRequest};
pub use object::{Reconcilable, SyncObject};
pub use queue::{BackoffConfig, WorkQueue};
pub use reconcile::Reconciler;
