use super::template::MachineTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying the deployment revision a MachineSet was created (or re-adopted) at
pub const MACHINE_SET_REVISION_ANNOTATION: &str = "fleet.io/revision";

/// Annotation recording `spec.replicas` of the owning deployment at the last scale
pub const DESIRED_REPLICAS_ANNOTATION: &str = "fleet.io/desired-replicas";

/// Annotation recording `spec.replicas + maxSurge` of the owning deployment at the last scale
pub const MAX_REPLICAS_ANNOTATION: &str = "fleet.io/max-replicas";

/// MachineSet is one immutable-template generation of a MachineDeployment
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "MachineSet",
    namespaced,
    status = "MachineSetStatus",
    shortname = "ms",
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct MachineSetSpec {
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    /// Number of desired machines
    #[serde(default)]
    pub replicas: i32,

    pub selector: LabelSelector,

    /// Snapshot of the deployment template this set was created from
    pub template: MachineTemplateSpec,
}

/// Status reported by the MachineSet controller (never written here)
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MachineSetStatus {
    /// Number of machines that currently exist
    #[serde(default)]
    pub replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Terminal problem reconciling machines (e.g., "InsufficientResources")
    #[serde(rename = "failureReason", skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(rename = "failureMessage", skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl MachineSet {
    /// Number of machines that currently exist, as reported in status
    pub fn actual_replicas(&self) -> i32 {
        self.status.as_ref().map(|s| s.replicas).unwrap_or(0)
    }

    pub fn ready_replicas(&self) -> i32 {
        self.status.as_ref().map(|s| s.ready_replicas).unwrap_or(0)
    }

    pub fn available_replicas(&self) -> i32 {
        self.status.as_ref().map(|s| s.available_replicas).unwrap_or(0)
    }

    /// Sets with desired replicas count as "active"
    pub fn is_active(&self) -> bool {
        self.spec.replicas > 0
    }

    fn annotation(&self, key: &str) -> Option<&String> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key))
    }

    /// Revision annotation, or 0 when absent or malformed
    pub fn revision(&self) -> i64 {
        self.annotation(MACHINE_SET_REVISION_ANNOTATION)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    }

    pub fn desired_replicas_annotation(&self) -> Option<i32> {
        self.annotation(DESIRED_REPLICAS_ANNOTATION)
            .and_then(|v| v.parse::<i32>().ok())
    }

    pub fn max_replicas_annotation(&self) -> Option<i32> {
        self.annotation(MAX_REPLICAS_ANNOTATION)
            .and_then(|v| v.parse::<i32>().ok())
    }
}
