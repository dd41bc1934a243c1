use super::template::{Condition, MachineTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation marking a deployment whose template is waiting on an external in-place upgrade
pub const IN_PLACE_UPGRADE_ANNOTATION: &str = "fleet.io/in-place-upgrade-pending";

/// Annotation carrying the revision of the current (new) MachineSet
pub const REVISION_ANNOTATION: &str = "fleet.io/revision";

/// Default number of old MachineSets kept after a rollout completes
pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 1;

/// MachineDeployment declares a group of machine replicas and how to roll them
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "MachineDeployment",
    namespaced,
    status = "MachineDeploymentStatus",
    shortname = "md",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Updated", "type":"integer", "jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct MachineDeploymentSpec {
    /// Name of the cluster the machines belong to
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    /// Number of desired machines
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Label selector for MachineSets; must match the template labels
    pub selector: LabelSelector,

    /// Template describes the machines that will be created
    pub template: MachineTemplateSpec,

    /// How existing machines are replaced by new ones
    #[serde(default)]
    pub strategy: MachineDeploymentStrategy,

    /// Number of old MachineSets to retain once a rollout completes.
    /// Defaults to 1 when not specified.
    #[serde(
        rename = "revisionHistoryLimit",
        skip_serializing_if = "Option::is_none"
    )]
    pub revision_history_limit: Option<i32>,

    /// Paused deployments are scaled but never rolled
    #[serde(default)]
    pub paused: bool,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MachineDeploymentStrategy {
    /// RollingUpdate (default) or InPlace
    #[serde(rename = "type", default)]
    pub strategy_type: StrategyType,

    /// Surge and unavailability budgets
    #[serde(rename = "rollingUpdate", skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateParams>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StrategyType {
    /// Create a new MachineSet and shift replicas within surge/unavailable budgets
    #[default]
    RollingUpdate,
    /// Wait for an external agent to upgrade machines without a new MachineSet
    InPlace,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RollingUpdateParams {
    /// Maximum number of machines that can be scheduled above the desired number.
    /// Value can be an absolute number (e.g., "1") or percentage (e.g., "25%").
    /// Defaults to "1" when not specified.
    #[serde(rename = "maxSurge", skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<String>,

    /// Maximum number of machines that can be unavailable during the update.
    /// Value can be an absolute number (e.g., "1") or percentage (e.g., "25%").
    /// Defaults to "0" when not specified.
    #[serde(rename = "maxUnavailable", skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,
}

/// Coarse lifecycle phase of a MachineDeployment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Fewer machines exist than desired
    ScalingUp,
    /// More machines exist than desired
    ScalingDown,
    /// All desired machines are ready
    Running,
    /// A MachineSet reported a failure
    Failed,
}

/// Status of the MachineDeployment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MachineDeploymentStatus {
    /// Generation most recently acted on by the controller
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Label selector in string form (for the scale subresource)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Total number of machines reported by all MachineSets
    #[serde(default)]
    pub replicas: i32,

    /// Number of machines belonging to the MachineSet matching the current template
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    /// Number of ready machines
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    /// Number of available machines
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    /// Desired machines that are not available yet
    #[serde(rename = "unavailableReplicas", default)]
    pub unavailable_replicas: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MachineDeployment {
    /// True when the in-place upgrade annotation is present
    pub fn has_in_place_annotation(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(IN_PLACE_UPGRADE_ANNOTATION))
            .unwrap_or(false)
    }

    pub fn revision_history_limit(&self) -> i32 {
        self.spec
            .revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
    }
}

#[cfg(test)]
#[path = "machine_deployment_test.rs"]
mod tests;
