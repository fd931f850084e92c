//! Tekton `TaskRun` (`tekton.dev/v1`).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::CustomResource;
use rekord_core::{Condition, ConditionView, StatusConditionAccessor};
use rekord_reconciler::{Reconcilable, SyncObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::knative::{self, KnativeCondition};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "tekton.dev",
    version = "v1",
    kind = "TaskRun",
    namespaced,
    status = "TaskRunStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KnativeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub struct TaskRunConditions<'a> {
    status: Option<&'a TaskRunStatus>,
}

impl ConditionView for TaskRunConditions<'_> {
    fn condition(&self, type_: &str) -> Option<Condition> { knative::find(&self.status?.conditions, type_) }
}

pub struct TaskRunAdapter<'a> {
    run: &'a TaskRun,
}

impl StatusConditionAccessor for TaskRunAdapter<'_> {
    fn status_conditions(&self) -> Box<dyn ConditionView + '_> {
        Box::new(TaskRunConditions { status: self.run.status.as_ref() })
    }
}

impl SyncObject for TaskRunAdapter<'_> {
    fn kind(&self) -> &str { "TaskRun" }
    fn api_version(&self) -> &str { "tekton.dev/v1" }
    fn meta(&self) -> &ObjectMeta { &self.run.metadata }
    fn to_json(&self) -> serde_json::Result<Value> { serde_json::to_value(self.run) }
}

impl Reconcilable for TaskRun {
    type Adapter<'a> = TaskRunAdapter<'a>;
    fn adapt(&self) -> TaskRunAdapter<'_> { TaskRunAdapter { run: self } }
}
