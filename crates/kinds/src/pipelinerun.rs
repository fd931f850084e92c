//! Tekton `PipelineRun` (`tekton.dev/v1`).

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
    kind = "PipelineRun",
    namespaced,
    status = "PipelineRunStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<PipelineRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KnativeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_references: Vec<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub struct PipelineRunConditions<'a> {
    status: Option<&'a PipelineRunStatus>,
}

impl ConditionView for PipelineRunConditions<'_> {
    fn condition(&self, type_: &str) -> Option<Condition> { knative::find(&self.status?.conditions, type_) }
}

pub struct PipelineRunAdapter<'a> {
    run: &'a PipelineRun,
}

impl StatusConditionAccessor for PipelineRunAdapter<'_> {
    fn status_conditions(&self) -> Box<dyn ConditionView + '_> {
        Box::new(PipelineRunConditions { status: self.run.status.as_ref() })
    }
}

impl SyncObject for PipelineRunAdapter<'_> {
    fn kind(&self) -> &str { "PipelineRun" }
    fn api_version(&self) -> &str { "tekton.dev/v1" }
    fn meta(&self) -> &ObjectMeta { &self.run.metadata }
    fn to_json(&self) -> serde_json::Result<Value> { serde_json::to_value(self.run) }
}

impl Reconcilable for PipelineRun {
    type Adapter<'a> = PipelineRunAdapter<'a>;
    fn adapt(&self) -> PipelineRunAdapter<'_> { PipelineRunAdapter { run: self } }
}
