use super::machineset::{build_machine_set, creation_order, set_annotation, MachineSetPool};
use super::reconcile::{Context, ReconcileError};
use super::scaling::Fenceposts;
use crate::controller::store::StoreError;
use crate::crd::machine_deployment::{MachineDeployment, REVISION_ANNOTATION};
use crate::crd::machine_set::{MachineSet, MACHINE_SET_REVISION_ANNOTATION};
use crate::crd::template::MachineTemplateSpec;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Split MachineSets into the one matching `template` and the rest
///
/// Sets are ordered by (creationTimestamp, name). When more than one set
/// matches, the most recently created one is the new set and the others are
/// treated as old.
pub fn classify_machine_sets(
    template: &MachineTemplateSpec,
    mut sets: Vec<MachineSet>,
) -> MachineSetPool {
    sets.sort_by(creation_order);

    let mut pool = MachineSetPool::default();
    for ms in sets {
        if !ms.spec.template.matches(template) {
            pool.old.push(ms);
            continue;
        }
        if let Some(previous) = pool.new.replace(ms) {
            warn!(
                machineset = ?previous.name_any(),
                "Multiple MachineSets match the deployment template, treating older one as old"
            );
            pool.old.push(previous);
        }
    }

    pool.old.sort_by(creation_order);
    pool
}

/// Revision for the new MachineSet: one past the highest old revision
pub fn next_revision(old: &[MachineSet]) -> i64 {
    old.iter().map(|ms| ms.revision()).max().unwrap_or(0) + 1
}

/// Find (and optionally create) the new MachineSet for the deployment
///
/// - An existing new set with a lower revision is re-annotated.
/// - With no new set and `create_if_missing`, a set with 0 replicas is
///   created; a name collision surfaces as a retryable
///   [`StoreError::AlreadyExists`].
/// - The deployment's revision annotation follows the new set.
///
/// # Arguments
/// * `md` - The deployment (replaced by the patched copy if its annotation changes)
/// * `pool` - Classified sets; `pool.new` is filled in or updated
/// * `create_if_missing` - Whether a missing new set should be created
pub async fn resolve_machine_sets(
    md: &mut MachineDeployment,
    pool: &mut MachineSetPool,
    create_if_missing: bool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let namespace = md.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let revision = next_revision(&pool.old);

    match pool.new.as_ref() {
        Some(existing) if existing.revision() < revision => {
            let mut ms = existing.clone();
            info!(
                machineset = ?ms.name_any(),
                from = ms.revision(),
                to = revision,
                "Updating MachineSet revision"
            );
            set_annotation(&mut ms, MACHINE_SET_REVISION_ANNOTATION, revision.to_string());
            pool.new = Some(ctx.store.update_machine_set(&namespace, &ms).await?);
        }
        Some(_) => {}
        None if create_if_missing => {
            let ms = build_machine_set(md, revision, Fenceposts::for_deployment(md)?)?;
            info!(
                machinedeployment = ?md.name_any(),
                machineset = ?ms.name_any(),
                revision = revision,
                "Creating MachineSet"
            );
            match ctx.store.create_machine_set(&namespace, &ms).await {
                Ok(created) => pool.new = Some(created),
                Err(StoreError::AlreadyExists(name)) => {
                    warn!(
                        machineset = ?name,
                        "MachineSet already exists but was not listed, retrying"
                    );
                    return Err(StoreError::AlreadyExists(name).into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => {
            debug!(machinedeployment = ?md.name_any(), "No MachineSet matches the template");
            return Ok(());
        }
    }

    if let Some(new) = pool.new.as_ref() {
        sync_deployment_revision(md, new.revision(), ctx).await?;
    }

    Ok(())
}

/// Keep the deployment's revision annotation equal to the new set's revision
async fn sync_deployment_revision(
    md: &mut MachineDeployment,
    revision: i64,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let value = revision.to_string();
    if md.annotations().get(REVISION_ANNOTATION) == Some(&value) {
        return Ok(());
    }

    let annotations = BTreeMap::from([(REVISION_ANNOTATION.to_string(), Some(value))]);
    *md = ctx
        .store
        .patch_deployment_annotations(md, &annotations)
        .await?;
    Ok(())
}
