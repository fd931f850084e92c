//! Canonical condition shape and the capabilities every resource kind adapter exposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type that marks a run as finished (`True` or `False`) or still going (`Unknown`).
pub const SUCCEEDED: &str = "Succeeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl From<&str> for ConditionStatus {
    fn from(s: &str) -> Self {
        match s {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// A condition translated out of some kind's native schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn is_true(&self) -> bool { self.status == ConditionStatus::True }
    pub fn is_false(&self) -> bool { self.status == ConditionStatus::False }
    pub fn is_unknown(&self) -> bool { self.status == ConditionStatus::Unknown }
}

/// Condition lookup over one resource's status.
///
/// Implementations are pure projections of borrowed data: looking up the same type
/// twice on an unchanged snapshot returns equal values, and a missing type is `None`
/// rather than an error.
pub trait ConditionView {
    fn condition(&self, type_: &str) -> Option<Condition>;
}

/// Gives access to the condition view for a resource's overall status.
pub trait StatusConditionAccessor {
    fn status_conditions(&self) -> Box<dyn ConditionView + '_>;
}
