use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label stamped on every MachineSet (and its template) with the template digest
pub const TEMPLATE_HASH_LABEL: &str = "fleet.io/template-hash";

/// Label linking a MachineSet back to the MachineDeployment that created it
pub const DEPLOYMENT_NAME_LABEL: &str = "fleet.io/deployment-name";

/// MachineTemplateSpec describes the machines a MachineSet creates
///
/// Two templates are considered equal when they are deep-equal after removing
/// the controller-owned [`TEMPLATE_HASH_LABEL`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MachineTemplateSpec {
    /// Labels and annotations applied to every machine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MachineTemplateMeta>,

    /// Desired state of each machine
    pub spec: MachineSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MachineTemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MachineSpec {
    /// Name of the cluster the machine belongs to
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    /// Kubernetes version the machine should run (e.g., "v1.29.0")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Bootstrap configuration source
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Provider-specific infrastructure object backing the machine
    #[serde(rename = "infrastructureRef")]
    pub infrastructure_ref: TemplateReference,

    /// Failure domain the machine should be placed in
    #[serde(rename = "failureDomain", skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Bootstrap {
    /// Reference to a bootstrap config template
    #[serde(rename = "configRef", skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<TemplateReference>,

    /// Pre-rendered bootstrap data secret (takes precedence over configRef)
    #[serde(rename = "dataSecretName", skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Reference to a provider template object
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TemplateReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl MachineTemplateSpec {
    /// Copy of the template without the controller-owned hash label
    pub fn normalized(&self) -> MachineTemplateSpec {
        let mut template = self.clone();
        if let Some(meta) = template.metadata.as_mut() {
            meta.labels.remove(TEMPLATE_HASH_LABEL);
            if meta.labels.is_empty() && meta.annotations.is_empty() {
                template.metadata = None;
            }
        }
        template
    }

    /// Deep equality ignoring the template-hash label
    pub fn matches(&self, other: &MachineTemplateSpec) -> bool {
        self.normalized() == other.normalized()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata
            .as_ref()
            .map(|m| m.labels.clone())
            .unwrap_or_default()
    }
}

/// Status value of a condition
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition types reported on a MachineDeployment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Enough machines are available to satisfy the unavailability budget
    Available,
    /// The rollout is making (or has finished making) progress
    Progressing,
    /// A MachineSet reported a failure creating or running machines
    ReplicaFailure,
}

/// Observed condition of a resource
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    /// One-word CamelCase reason for the last transition
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the status changed (RFC3339)
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(version: &str) -> MachineTemplateSpec {
        MachineTemplateSpec {
            metadata: Some(MachineTemplateMeta {
                labels: BTreeMap::from([("pool".to_string(), "workers".to_string())]),
                annotations: BTreeMap::new(),
            }),
            spec: MachineSpec {
                cluster_name: "my-cluster".to_string(),
                version: Some(version.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_matches_ignores_hash_label() {
        let a = template("v1.28.0");
        let mut b = a.clone();
        if let Some(meta) = b.metadata.as_mut() {
            meta.labels
                .insert(TEMPLATE_HASH_LABEL.to_string(), "abc".to_string());
        }

        assert_ne!(a, b);
        assert!(a.matches(&b));
    }

    #[test]
    fn test_matches_detects_version_change() {
        assert!(!template("v1.28.0").matches(&template("v1.29.0")));
    }

    #[test]
    fn test_normalized_drops_empty_metadata() {
        let mut t = MachineTemplateSpec::default();
        t.metadata = Some(MachineTemplateMeta {
            labels: BTreeMap::from([(TEMPLATE_HASH_LABEL.to_string(), "abc".to_string())]),
            annotations: BTreeMap::new(),
        });

        assert_eq!(t.normalized(), MachineTemplateSpec::default());
    }
}
