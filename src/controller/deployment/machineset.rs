use super::reconcile::{Context, ReconcileError};
use super::scaling::{Fenceposts, ScalePlan};
use crate::crd::machine_deployment::MachineDeployment;
use crate::crd::machine_set::{
    MachineSet, MachineSetSpec, DESIRED_REPLICAS_ANNOTATION, MACHINE_SET_REVISION_ANNOTATION,
    MAX_REPLICAS_ANNOTATION,
};
use crate::crd::template::{
    MachineTemplateMeta, MachineTemplateSpec, DEPLOYMENT_NAME_LABEL, TEMPLATE_HASH_LABEL,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Compute a stable 10-character hash for a MachineTemplateSpec
///
/// FNV-1a over the JSON of the normalized template (hash label removed), so
/// the digest of a MachineSet's template equals the digest of the deployment
/// template it was created from.
///
/// # Errors
/// Returns SerializationError if the template cannot be serialized to JSON
pub fn compute_template_hash(template: &MachineTemplateSpec) -> Result<String, ReconcileError> {
    let json = serde_json::to_string(&template.normalized())
        .map_err(|e| ReconcileError::SerializationError(e.to_string()))?;

    // FNV-1a (deterministic across processes, unlike DefaultHasher/SipHash)
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in json.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }

    Ok(format!("{hash:016x}")[..10].to_string())
}

/// Name of the MachineSet for a deployment and template hash
pub fn machine_set_name(deployment_name: &str, template_hash: &str) -> String {
    format!("{deployment_name}-{template_hash}")
}

/// True when `md` is the controller owner of `ms`
///
/// Matches on UID when the deployment has one, on name otherwise.
pub fn is_owned_by(ms: &MachineSet, md: &MachineDeployment) -> bool {
    ms.owner_references().iter().any(|owner| {
        owner.controller == Some(true)
            && owner.kind == "MachineDeployment"
            && match md.metadata.uid.as_deref() {
                Some(uid) => owner.uid == uid,
                None => Some(owner.name.as_str()) == md.metadata.name.as_deref(),
            }
    })
}

/// Order by creation timestamp, then name
pub fn creation_order(a: &MachineSet, b: &MachineSet) -> Ordering {
    a.metadata
        .creation_timestamp
        .cmp(&b.metadata.creation_timestamp)
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// The MachineSets of one deployment, split by template
#[derive(Debug, Clone, Default)]
pub struct MachineSetPool {
    /// Set whose template matches the deployment template
    pub new: Option<MachineSet>,
    /// All other sets, oldest first
    pub old: Vec<MachineSet>,
}

impl MachineSetPool {
    /// Old sets followed by the new set
    pub fn all(&self) -> impl Iterator<Item = &MachineSet> {
        self.old.iter().chain(self.new.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_none() && self.old.is_empty()
    }

    /// Swap in a newer copy of a set (matched by name)
    pub fn replace(&mut self, updated: MachineSet) {
        let name = updated.name_any();
        if let Some(new) = self.new.as_mut() {
            if new.name_any() == name {
                *new = updated;
                return;
            }
        }
        if let Some(old) = self.old.iter_mut().find(|ms| ms.name_any() == name) {
            *old = updated;
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.old.retain(|ms| ms.name_any() != name);
    }
}

/// Build the MachineSet for the deployment's current template
///
/// Created with 0 replicas; the scaler grows it. Carries:
/// - Labels: template labels, template hash, deployment name
/// - Name: `{deployment-name}-{template-hash}`
/// - Owner reference: the deployment (controller)
/// - Annotations: revision, desired replicas, max replicas
pub fn build_machine_set(
    md: &MachineDeployment,
    revision: i64,
    fenceposts: Fenceposts,
) -> Result<MachineSet, ReconcileError> {
    let md_name = md.metadata.name.as_ref().ok_or(ReconcileError::MissingName)?;
    let template_hash = compute_template_hash(&md.spec.template)?;
    let max_replicas = fenceposts.max_replicas(md.spec.replicas)?;

    let mut labels = md.spec.template.labels();
    labels.insert(TEMPLATE_HASH_LABEL.to_string(), template_hash.clone());
    labels.insert(DEPLOYMENT_NAME_LABEL.to_string(), md_name.clone());

    let mut template = md.spec.template.clone();
    let template_meta = template
        .metadata
        .get_or_insert_with(MachineTemplateMeta::default);
    template_meta
        .labels
        .insert(TEMPLATE_HASH_LABEL.to_string(), template_hash.clone());

    let mut selector = md.spec.selector.clone();
    selector
        .match_labels
        .get_or_insert_with(BTreeMap::new)
        .insert(TEMPLATE_HASH_LABEL.to_string(), template_hash.clone());

    let annotations = BTreeMap::from([
        (
            MACHINE_SET_REVISION_ANNOTATION.to_string(),
            revision.to_string(),
        ),
        (
            DESIRED_REPLICAS_ANNOTATION.to_string(),
            md.spec.replicas.to_string(),
        ),
        (
            MAX_REPLICAS_ANNOTATION.to_string(),
            max_replicas.to_string(),
        ),
    ]);

    Ok(MachineSet {
        metadata: ObjectMeta {
            name: Some(machine_set_name(md_name, &template_hash)),
            namespace: md.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(md, md_name)]),
            ..Default::default()
        },
        spec: MachineSetSpec {
            cluster_name: md.spec.cluster_name.clone(),
            replicas: 0,
            selector,
            template,
        },
        status: None,
    })
}

fn owner_reference(md: &MachineDeployment, md_name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "fleet.io/v1alpha1".to_string(),
        kind: "MachineDeployment".to_string(),
        name: md_name.to_string(),
        uid: md.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Set one annotation, returning true when the value changed
pub fn set_annotation(ms: &mut MachineSet, key: &str, value: String) -> bool {
    let annotations = ms.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if annotations.get(key) == Some(&value) {
        return false;
    }
    annotations.insert(key.to_string(), value);
    true
}

/// Apply a scale plan through the store
///
/// Every set whose size changes is written together with its
/// desired-replicas / max-replicas annotations. Active sets that keep their
/// size are written only when those annotations are stale. Updated copies
/// replace the pool entries.
pub async fn apply_scale_plan(
    md: &MachineDeployment,
    pool: &mut MachineSetPool,
    plan: &ScalePlan,
    fenceposts: Fenceposts,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let namespace = md.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let desired = md.spec.replicas;
    let max_replicas = fenceposts.max_replicas(desired)?;

    let sets: Vec<MachineSet> = pool.all().cloned().collect();
    for current in sets {
        let target = plan.target(&current);
        let resized = target != current.spec.replicas;
        if !resized && target == 0 {
            continue;
        }

        let mut ms = current.clone();
        ms.spec.replicas = target;
        let desired_changed =
            set_annotation(&mut ms, DESIRED_REPLICAS_ANNOTATION, desired.to_string());
        let max_changed = set_annotation(&mut ms, MAX_REPLICAS_ANNOTATION, max_replicas.to_string());

        if !resized && !desired_changed && !max_changed {
            debug!(
                machineset = ?ms.name_any(),
                replicas = target,
                "MachineSet already at correct scale"
            );
            continue;
        }

        if resized {
            info!(
                machinedeployment = ?md.name_any(),
                machineset = ?ms.name_any(),
                current = current.spec.replicas,
                desired = target,
                "Scaling MachineSet"
            );
        } else {
            debug!(
                machineset = ?ms.name_any(),
                desired_replicas = desired,
                max_replicas = max_replicas,
                "Refreshing MachineSet scale annotations"
            );
        }

        let updated = ctx.store.update_machine_set(&namespace, &ms).await?;
        pool.replace(updated);
    }

    Ok(())
}
