//! Shipwright `BuildRun` (`shipwright.io/v1beta1`).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::CustomResource;
use rekord_core::{Condition, ConditionStatus, ConditionView, StatusConditionAccessor};
use rekord_reconciler::{Reconcilable, SyncObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "BuildRun",
    namespaced,
    status = "BuildRunStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ReferencedBuild>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Embedded build definition, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<BuildRunCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Shipwright's own condition type: same meaning as the canonical one, non-optional
/// reason and message.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl From<&BuildRunCondition> for Condition {
    fn from(c: &BuildRunCondition) -> Self {
        Condition {
            type_: c.type_.clone(),
            status: ConditionStatus::from(c.status.as_str()),
            last_transition_time: c.last_transition_time.as_ref().map(|t| t.0),
            reason: c.reason.clone(),
            message: c.message.clone(),
        }
    }
}

pub struct BuildRunConditions<'a> {
    status: Option<&'a BuildRunStatus>,
}

impl ConditionView for BuildRunConditions<'_> {
    fn condition(&self, type_: &str) -> Option<Condition> {
        self.status?.conditions.iter().find(|c| c.type_ == type_).map(Condition::from)
    }
}

/// Borrowing adapter over a cached `BuildRun`.
pub struct BuildRunAdapter<'a> {
    run: &'a BuildRun,
}

impl StatusConditionAccessor for BuildRunAdapter<'_> {
    fn status_conditions(&self) -> Box<dyn ConditionView + '_> {
        Box::new(BuildRunConditions { status: self.run.status.as_ref() })
    }
}

impl SyncObject for BuildRunAdapter<'_> {
    fn kind(&self) -> &str { "BuildRun" }
    fn api_version(&self) -> &str { "shipwright.io/v1beta1" }
    fn meta(&self) -> &ObjectMeta { &self.run.metadata }
    fn to_json(&self) -> serde_json::Result<Value> { serde_json::to_value(self.run) }
}

impl Reconcilable for BuildRun {
    type Adapter<'a> = BuildRunAdapter<'a>;
    fn adapt(&self) -> BuildRunAdapter<'_> { BuildRunAdapter { run: self } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rekord_core::SUCCEEDED;

    fn cond(type_: &str, status: &str, reason: &str, message: &str) -> BuildRunCondition {
        BuildRunCondition {
            type_: type_.into(),
            status: status.into(),
            last_transition_time: Some(Time(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())),
            reason: reason.into(),
            message: message.into(),
        }
    }

    fn run_with(conditions: Vec<BuildRunCondition>) -> BuildRun {
        let mut run = BuildRun::new("my-run", BuildRunSpec::default());
        run.metadata.namespace = Some("build".into());
        run.status = Some(BuildRunStatus { conditions, ..Default::default() });
        run
    }

    #[test]
    fn every_native_condition_translates_field_for_field() {
        let native = vec![
            cond(SUCCEEDED, "True", "Succeeded", "All Steps have completed executing"),
            cond("Ready", "False", "Pending", "waiting for pod"),
            cond("Scheduled", "Unknown", "", ""),
        ];
        let run = run_with(native.clone());
        let adapted = run.adapt();
        let view = adapted.status_conditions();
        for n in &native {
            let c = view.condition(&n.type_).expect("condition present");
            assert_eq!(c.type_, n.type_);
            assert_eq!(c.status.as_str(), n.status);
            assert_eq!(c.reason, n.reason);
            assert_eq!(c.message, n.message);
            assert_eq!(c.last_transition_time, n.last_transition_time.as_ref().map(|t| t.0));
        }
        assert_eq!(view.condition("Missing"), None);
    }

    #[test]
    fn first_match_wins_and_lookups_are_repeatable() {
        let run = run_with(vec![cond(SUCCEEDED, "False", "Failed", "first"), cond(SUCCEEDED, "True", "Succeeded", "second")]);
        let adapted = run.adapt();
        let a = adapted.status_conditions().condition(SUCCEEDED);
        let b = adapted.status_conditions().condition(SUCCEEDED);
        assert_eq!(a, b);
        assert_eq!(a.map(|c| c.message), Some("first".to_string()));
    }

    #[test]
    fn run_without_status_has_no_conditions() {
        let run = BuildRun::new("fresh", BuildRunSpec::default());
        assert_eq!(run.adapt().status_conditions().condition(SUCCEEDED), None);
    }

    #[test]
    fn decodes_wire_json_and_projects_metadata() {
        let run: BuildRun = serde_json::from_value(serde_json::json!({
            "apiVersion": "shipwright.io/v1beta1",
            "kind": "BuildRun",
            "metadata": {
                "name": "my-run",
                "namespace": "build",
                "uid": "5f0c3b2e-6d1a-4a5e-9d2c-0c6f1f9b7a11",
                "resourceVersion": "42",
                "annotations": { "results.rekord.dev/stored": "true" },
                "finalizers": ["results.rekord.dev/store"]
            },
            "spec": { "build": { "name": "kaniko-build" }, "serviceAccount": "builder", "output": { "image": "registry/app" } },
            "status": {
                "conditions": [{
                    "type": "Succeeded",
                    "status": "False",
                    "lastTransitionTime": "2024-05-01T12:00:00Z",
                    "reason": "BuildRunTimeout",
                    "message": "BuildRun my-run failed to finish within 10m0s"
                }],
                "buildSpec": { "strategy": { "name": "kaniko" } }
            }
        }))
        .unwrap();

        assert_eq!(run.spec.build.as_ref().and_then(|b| b.name.as_deref()), Some("kaniko-build"));
        assert!(run.spec.extra.contains_key("output"));

        let adapted = run.adapt();
        assert_eq!(adapted.identity().to_string(), "build/my-run");
        assert_eq!(adapted.uid(), Some("5f0c3b2e-6d1a-4a5e-9d2c-0c6f1f9b7a11"));
        assert_eq!(adapted.resource_version(), Some("42"));
        assert_eq!(adapted.annotation("results.rekord.dev/stored"), Some("true"));
        assert!(adapted.has_finalizer("results.rekord.dev/store"));
        assert!(!adapted.is_deleting());

        let c = adapted.status_conditions().condition(SUCCEEDED).unwrap();
        assert!(c.is_false());
        assert_eq!(c.reason, "BuildRunTimeout");
        assert_eq!(c.last_transition_time, Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));

        let json = adapted.to_json().unwrap();
        assert_eq!(json["kind"], "BuildRun");
        assert_eq!(json["apiVersion"], "shipwright.io/v1beta1");
        assert_eq!(json["status"]["buildSpec"]["strategy"]["name"], "kaniko");
    }
}
