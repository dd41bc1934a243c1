//! Builders for MachineDeployments and MachineSets used across controller tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::crd::machine_deployment::{
    MachineDeployment, MachineDeploymentSpec, MachineDeploymentStrategy, RollingUpdateParams,
    StrategyType,
};
use crate::crd::machine_set::{
    MachineSet, MachineSetSpec, MachineSetStatus, DESIRED_REPLICAS_ANNOTATION,
    MAX_REPLICAS_ANNOTATION,
};
use crate::crd::template::{
    MachineSpec, MachineTemplateMeta, MachineTemplateSpec, TemplateReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time};
use std::collections::BTreeMap;

pub fn pool_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("pool".to_string(), "workers".to_string())])
}

/// Template that differs only by Kubernetes version
pub fn template(version: &str) -> MachineTemplateSpec {
    MachineTemplateSpec {
        metadata: Some(MachineTemplateMeta {
            labels: pool_labels(),
            annotations: BTreeMap::new(),
        }),
        spec: MachineSpec {
            cluster_name: "prod".to_string(),
            version: Some(version.to_string()),
            infrastructure_ref: TemplateReference {
                api_version: "infrastructure.fleet.io/v1alpha1".to_string(),
                kind: "DockerMachineTemplate".to_string(),
                name: format!("workers-{version}"),
            },
            ..Default::default()
        },
    }
}

/// RFC3339 timestamp `offset_secs` after 2024-01-01T00:00:00Z
pub fn time_at(offset_secs: i64) -> Time {
    let at = chrono::DateTime::from_timestamp(1_704_067_200 + offset_secs, 0)
        .unwrap()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::json!(at)).unwrap()
}

pub fn deployment(replicas: i32, version: &str) -> MachineDeployment {
    let mut md = MachineDeployment::new(
        "workers",
        MachineDeploymentSpec {
            cluster_name: "prod".to_string(),
            replicas,
            selector: LabelSelector {
                match_labels: Some(pool_labels()),
                ..Default::default()
            },
            template: template(version),
            strategy: MachineDeploymentStrategy::default(),
            revision_history_limit: None,
            paused: false,
        },
    );
    md.metadata.namespace = Some("default".to_string());
    md.metadata.uid = Some("uid-workers".to_string());
    md.metadata.generation = Some(1);
    md
}

pub fn rolling_deployment(
    replicas: i32,
    version: &str,
    max_surge: &str,
    max_unavailable: &str,
) -> MachineDeployment {
    let mut md = deployment(replicas, version);
    md.spec.strategy = MachineDeploymentStrategy {
        strategy_type: StrategyType::RollingUpdate,
        rolling_update: Some(RollingUpdateParams {
            max_surge: Some(max_surge.to_string()),
            max_unavailable: Some(max_unavailable.to_string()),
        }),
    };
    md
}

pub fn in_place_deployment(replicas: i32, version: &str) -> MachineDeployment {
    let mut md = deployment(replicas, version);
    md.spec.strategy.strategy_type = StrategyType::InPlace;
    md
}

/// Bare MachineSet with `replicas` desired and `available` available, created at `created`
pub fn machine_set(name: &str, replicas: i32, available: i32, created: i64) -> MachineSet {
    let mut ms = MachineSet::new(
        name,
        MachineSetSpec {
            cluster_name: "prod".to_string(),
            replicas,
            selector: LabelSelector {
                match_labels: Some(pool_labels()),
                ..Default::default()
            },
            template: template("v1.28.0"),
        },
    );
    ms.metadata.namespace = Some("default".to_string());
    ms.metadata.labels = Some(pool_labels());
    ms.metadata.creation_timestamp = Some(time_at(created));
    ms.status = Some(MachineSetStatus {
        replicas,
        ready_replicas: available,
        available_replicas: available,
        ..Default::default()
    });
    ms
}

/// Add the scale annotations a previous pass would have written
pub fn with_scale_annotations(mut ms: MachineSet, desired: i32, max: i32) -> MachineSet {
    let annotations = ms.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(DESIRED_REPLICAS_ANNOTATION.to_string(), desired.to_string());
    annotations.insert(MAX_REPLICAS_ANNOTATION.to_string(), max.to_string());
    ms
}

/// Make `ms` controlled by the `workers` deployment from [`deployment`]
pub fn owned(mut ms: MachineSet) -> MachineSet {
    ms.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "fleet.io/v1alpha1".to_string(),
        kind: "MachineDeployment".to_string(),
        name: "workers".to_string(),
        uid: "uid-workers".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    ms
}
