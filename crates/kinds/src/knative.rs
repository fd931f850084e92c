//! Knative-style conditions as used by Tekton resources.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use rekord_core::{Condition, ConditionStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnativeCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// First condition of the given type, translated. Severity has no canonical counterpart.
pub(crate) fn find(conditions: &[KnativeCondition], type_: &str) -> Option<Condition> {
    conditions.iter().find(|c| c.type_ == type_).map(|c| Condition {
        type_: c.type_.clone(),
        status: ConditionStatus::from(c.status.as_str()),
        last_transition_time: c.last_transition_time.as_ref().map(|t| t.0),
        reason: c.reason.clone(),
        message: c.message.clone(),
    })
}
