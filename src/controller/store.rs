//! Cluster state store used by the MachineDeployment controller
//!
//! All reads and writes of MachineSets and MachineDeployments go through
//! [`ClusterStore`]. Production code uses [`KubeStore`] (the API server via
//! `kube`); tests use `MockStore`, an in-memory store that records every write.

use crate::crd::machine_deployment::{MachineDeployment, MachineDeploymentStatus};
use crate::crd::machine_set::MachineSet;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conflict writing {0}: object was modified")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

impl StoreError {
    /// Map a kube error for object `name` onto the store's error kinds
    pub fn from_kube(err: kube::Error, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(name.to_string())
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(name.to_string()),
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(name.to_string()),
            other => StoreError::Api(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Access to MachineSets and MachineDeployments
///
/// Updates and patches carry the object's `resourceVersion`; a stale version
/// fails with [`StoreError::Conflict`].
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn list_machine_sets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<MachineSet>, StoreError>;

    async fn create_machine_set(
        &self,
        namespace: &str,
        machine_set: &MachineSet,
    ) -> Result<MachineSet, StoreError>;

    async fn update_machine_set(
        &self,
        namespace: &str,
        machine_set: &MachineSet,
    ) -> Result<MachineSet, StoreError>;

    async fn delete_machine_set(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Set (`Some`) or remove (`None`) annotations on a MachineDeployment
    async fn patch_deployment_annotations(
        &self,
        deployment: &MachineDeployment,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<MachineDeployment, StoreError>;

    async fn patch_deployment_status(
        &self,
        deployment: &MachineDeployment,
        status: &MachineDeploymentStatus,
    ) -> Result<MachineDeployment, StoreError>;
}

/// Production store backed by the Kubernetes API server
pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        KubeStore { client }
    }

    fn machine_sets(&self, namespace: &str) -> Api<MachineSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, deployment: &MachineDeployment) -> Api<MachineDeployment> {
        match deployment.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_machine_sets(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<MachineSet>, StoreError> {
        let params = ListParams::default().labels(&selector_to_string(selector));
        let list = self
            .machine_sets(namespace)
            .list(&params)
            .await
            .map_err(|e| StoreError::from_kube(e, "MachineSet list"))?;
        Ok(list.items)
    }

    async fn create_machine_set(
        &self,
        namespace: &str,
        machine_set: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        let name = machine_set.name_any();
        self.machine_sets(namespace)
            .create(&PostParams::default(), machine_set)
            .await
            .map_err(|e| StoreError::from_kube(e, &name))
    }

    async fn update_machine_set(
        &self,
        namespace: &str,
        machine_set: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        let name = machine_set.name_any();
        self.machine_sets(namespace)
            .replace(&name, &PostParams::default(), machine_set)
            .await
            .map_err(|e| StoreError::from_kube(e, &name))
    }

    async fn delete_machine_set(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.machine_sets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| StoreError::from_kube(e, name))?;
        Ok(())
    }

    async fn patch_deployment_annotations(
        &self,
        deployment: &MachineDeployment,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<MachineDeployment, StoreError> {
        let name = deployment.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": deployment.resource_version(),
                "annotations": annotations
            }
        });
        debug!(machinedeployment = ?name, annotations = ?annotations, "Patching annotations");
        self.deployments(deployment)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &name))
    }

    async fn patch_deployment_status(
        &self,
        deployment: &MachineDeployment,
        status: &MachineDeploymentStatus,
    ) -> Result<MachineDeployment, StoreError> {
        let name = deployment.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": deployment.resource_version()
            },
            "status": status
        });
        self.deployments(deployment)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &name))
    }
}

/// Render a LabelSelector in the API server's query syntax
///
/// `matchLabels` become `k=v`; expressions become `k in (a,b)`,
/// `k notin (a,b)`, `k` and `!k`. An empty selector renders as "".
pub fn selector_to_string(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            parts.push(format!("{key}={value}"));
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default().join(",");
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expr.key, values)),
                "NotIn" => parts.push(format!("{} notin ({})", expr.key, values)),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                _ => {}
            }
        }
    }

    parts.join(",")
}

/// Evaluate a LabelSelector against a label set
///
/// Unknown operators never match.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_ok = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => labels.get(&expr.key).is_some_and(|v| values.contains(v)),
            "NotIn" => !labels.get(&expr.key).is_some_and(|v| values.contains(v)),
            "Exists" => labels.contains_key(&expr.key),
            "DoesNotExist" => !labels.contains_key(&expr.key),
            _ => false,
        }
    });

    labels_ok && expressions_ok
}

/// A write recorded by `MockStore`
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    CreateMachineSet(String),
    UpdateMachineSet(String),
    DeleteMachineSet(String),
    PatchAnnotations(String),
    PatchStatus(String),
}

#[cfg(test)]
#[derive(Default)]
struct MockState {
    machine_sets: BTreeMap<String, MachineSet>,
    deployments: BTreeMap<String, MachineDeployment>,
    resource_version: u64,
    created: i64,
    writes: Vec<StoreWrite>,
    conflict_next_write: bool,
}

#[cfg(test)]
impl MockState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn take_conflict(&mut self, name: &str) -> Result<(), StoreError> {
        if std::mem::take(&mut self.conflict_next_write) {
            return Err(StoreError::Conflict(name.to_string()));
        }
        Ok(())
    }
}

/// In-memory store for tests
///
/// Objects are keyed by name (tests use a single namespace). Newly created
/// MachineSets get creation timestamps one second apart so ordering is stable.
#[cfg(test)]
#[derive(Default)]
pub struct MockStore {
    state: std::sync::Mutex<MockState>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a MachineSet without recording a write
    pub fn insert_machine_set(&self, mut machine_set: MachineSet) {
        let mut state = self.state.lock().unwrap();
        if machine_set.metadata.creation_timestamp.is_none() {
            state.created += 1;
            machine_set.metadata.creation_timestamp = Some(mock_time(state.created));
        }
        machine_set.metadata.resource_version = Some(state.next_resource_version());
        machine_set.metadata.generation.get_or_insert(1);
        state
            .machine_sets
            .insert(machine_set.name_any(), machine_set);
    }

    /// Seed a MachineDeployment without recording a write
    pub fn insert_deployment(&self, mut deployment: MachineDeployment) {
        let mut state = self.state.lock().unwrap();
        deployment.metadata.resource_version = Some(state.next_resource_version());
        state
            .deployments
            .insert(deployment.name_any(), deployment);
    }

    pub fn machine_set(&self, name: &str) -> Option<MachineSet> {
        self.state.lock().unwrap().machine_sets.get(name).cloned()
    }

    /// All stored MachineSets ordered by name
    pub fn machine_sets(&self) -> Vec<MachineSet> {
        self.state
            .lock()
            .unwrap()
            .machine_sets
            .values()
            .cloned()
            .collect()
    }

    pub fn deployment(&self, name: &str) -> Option<MachineDeployment> {
        self.state.lock().unwrap().deployments.get(name).cloned()
    }

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Make the next write fail with a conflict
    pub fn conflict_next_write(&self) {
        self.state.lock().unwrap().conflict_next_write = true;
    }

    /// Pretend the MachineSet controller caught up: every machine exists and is available
    pub fn settle(&self) {
        let mut state = self.state.lock().unwrap();
        for ms in state.machine_sets.values_mut() {
            let replicas = ms.spec.replicas;
            ms.status = Some(crate::crd::machine_set::MachineSetStatus {
                replicas,
                ready_replicas: replicas,
                available_replicas: replicas,
                observed_generation: ms.metadata.generation,
                ..Default::default()
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
fn mock_time(offset_secs: i64) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    let at = chrono::DateTime::from_timestamp(1_704_067_200 + offset_secs, 0)
        .expect("valid timestamp")
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::json!(at)).expect("valid RFC3339 time")
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl ClusterStore for MockStore {
    async fn list_machine_sets(
        &self,
        _namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<MachineSet>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .machine_sets
            .values()
            .filter(|ms| selector_matches(selector, ms.labels()))
            .cloned()
            .collect())
    }

    async fn create_machine_set(
        &self,
        _namespace: &str,
        machine_set: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        let name = machine_set.name_any();
        let mut state = self.state.lock().unwrap();
        state.take_conflict(&name)?;
        if state.machine_sets.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let mut created = machine_set.clone();
        state.created += 1;
        created.metadata.creation_timestamp = Some(mock_time(state.created));
        created.metadata.resource_version = Some(state.next_resource_version());
        created.metadata.generation = Some(1);
        state.machine_sets.insert(name.clone(), created.clone());
        state.writes.push(StoreWrite::CreateMachineSet(name));
        Ok(created)
    }

    async fn update_machine_set(
        &self,
        _namespace: &str,
        machine_set: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        let name = machine_set.name_any();
        let mut state = self.state.lock().unwrap();
        state.take_conflict(&name)?;
        let stored = state
            .machine_sets
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if stored.metadata.resource_version != machine_set.metadata.resource_version {
            return Err(StoreError::Conflict(name));
        }

        let mut updated = machine_set.clone();
        updated.status = stored.status.clone();
        updated.metadata.resource_version = Some(state.next_resource_version());
        let generation = stored.metadata.generation.unwrap_or(1);
        updated.metadata.generation = Some(if stored.spec != machine_set.spec {
            generation + 1
        } else {
            generation
        });
        state.machine_sets.insert(name.clone(), updated.clone());
        state.writes.push(StoreWrite::UpdateMachineSet(name));
        Ok(updated)
    }

    async fn delete_machine_set(&self, _namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.take_conflict(name)?;
        if state.machine_sets.remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        state
            .writes
            .push(StoreWrite::DeleteMachineSet(name.to_string()));
        Ok(())
    }

    async fn patch_deployment_annotations(
        &self,
        deployment: &MachineDeployment,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<MachineDeployment, StoreError> {
        let name = deployment.name_any();
        let mut state = self.state.lock().unwrap();
        state.take_conflict(&name)?;
        let mut stored = state
            .deployments
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(StoreError::Conflict(name));
        }

        let current = stored.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(v) => current.insert(key.clone(), v.clone()),
                None => current.remove(key),
            };
        }
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.deployments.insert(name.clone(), stored.clone());
        state.writes.push(StoreWrite::PatchAnnotations(name));
        Ok(stored)
    }

    async fn patch_deployment_status(
        &self,
        deployment: &MachineDeployment,
        status: &MachineDeploymentStatus,
    ) -> Result<MachineDeployment, StoreError> {
        let name = deployment.name_any();
        let mut state = self.state.lock().unwrap();
        state.take_conflict(&name)?;
        let mut stored = state
            .deployments
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(StoreError::Conflict(name));
        }

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(state.next_resource_version());
        state.deployments.insert(name.clone(), stored.clone());
        state.writes.push(StoreWrite::PatchStatus(name));
        Ok(stored)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_selector_to_string() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("pool", "workers")])),
            match_expressions: Some(vec![
                requirement("zone", "In", &["a", "b"]),
                requirement("gpu", "DoesNotExist", &[]),
            ]),
        };

        assert_eq!(
            selector_to_string(&selector),
            "pool=workers,zone in (a,b),!gpu"
        );
        assert_eq!(selector_to_string(&LabelSelector::default()), "");
    }

    #[test]
    fn test_selector_matches_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("pool", "workers")])),
            match_expressions: Some(vec![
                requirement("zone", "NotIn", &["c"]),
                requirement("arch", "Exists", &[]),
            ]),
        };

        assert!(selector_matches(
            &selector,
            &labels(&[("pool", "workers"), ("zone", "a"), ("arch", "arm64")])
        ));
        // missing key satisfies NotIn
        assert!(selector_matches(
            &selector,
            &labels(&[("pool", "workers"), ("arch", "amd64")])
        ));
        assert!(!selector_matches(
            &selector,
            &labels(&[("pool", "workers"), ("zone", "c"), ("arch", "amd64")])
        ));
        assert!(!selector_matches(&selector, &labels(&[("pool", "workers")])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(selector_matches(&LabelSelector::default(), &BTreeMap::new()));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Conflict("ms".into()).is_conflict());
        assert!(StoreError::AlreadyExists("ms".into()).is_conflict());
        assert!(StoreError::NotFound("ms".into()).is_not_found());
        assert!(!StoreError::NotFound("ms".into()).is_conflict());
    }

    fn machine_set(name: &str) -> MachineSet {
        let mut ms = MachineSet::new(
            name,
            crate::crd::machine_set::MachineSetSpec {
                cluster_name: "prod".to_string(),
                replicas: 1,
                selector: LabelSelector::default(),
                template: Default::default(),
            },
        );
        ms.metadata.labels = Some(labels(&[("pool", "workers")]));
        ms
    }

    #[tokio::test]
    async fn test_mock_store_rejects_stale_update() {
        let store = MockStore::new();
        store.insert_machine_set(machine_set("workers-a"));

        let mut stale = store.machine_set("workers-a").unwrap();
        stale.metadata.resource_version = Some("0".to_string());
        stale.spec.replicas = 3;

        let result = store.update_machine_set("default", &stale).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_mock_store_create_twice_is_already_exists() {
        let store = MockStore::new();
        store
            .create_machine_set("default", &machine_set("workers-a"))
            .await
            .unwrap();

        let result = store
            .create_machine_set("default", &machine_set("workers-a"))
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(
            store.writes(),
            vec![StoreWrite::CreateMachineSet("workers-a".to_string())]
        );
    }

    #[tokio::test]
    async fn test_mock_store_update_bumps_generation_on_spec_change() {
        let store = MockStore::new();
        store.insert_machine_set(machine_set("workers-a"));

        let mut ms = store.machine_set("workers-a").unwrap();
        ms.spec.replicas = 2;
        let updated = store.update_machine_set("default", &ms).await.unwrap();

        assert_eq!(updated.metadata.generation, Some(2));
        assert_ne!(updated.metadata.resource_version, ms.metadata.resource_version);
    }
}
