use super::machineset::{creation_order, MachineSetPool};
use super::reconcile::{Context, ReconcileError};
use crate::crd::machine_deployment::{MachineDeployment, MachineDeploymentStatus};
use crate::crd::machine_set::MachineSet;
use kube::ResourceExt;
use tracing::{debug, info};

/// True when `status` shows every desired machine updated and available
/// for the deployment's latest generation
pub fn status_is_complete(md: &MachineDeployment, status: &MachineDeploymentStatus) -> bool {
    let desired = md.spec.replicas;
    let observed = status.observed_generation.unwrap_or(0);
    let generation = md.metadata.generation.unwrap_or(0);

    status.updated_replicas == desired
        && status.replicas == desired
        && status.available_replicas == desired
        && observed >= generation
}

/// Rollout complete according to the deployment's current status
pub fn is_complete(md: &MachineDeployment) -> bool {
    md.status
        .as_ref()
        .map(|status| status_is_complete(md, status))
        .unwrap_or(false)
}

/// Old MachineSets to delete so at most `limit` remain
///
/// The oldest `len - limit` sets (not already being deleted) are candidates;
/// a candidate is skipped while it still has machines or its latest
/// generation has not been observed.
pub fn select_for_cleanup(old: &[MachineSet], limit: i32) -> Vec<MachineSet> {
    let mut alive: Vec<&MachineSet> = old
        .iter()
        .filter(|ms| ms.metadata.deletion_timestamp.is_none())
        .collect();

    let diff = alive.len() as i64 - limit.max(0) as i64;
    if diff <= 0 {
        return Vec::new();
    }

    alive.sort_by(|a, b| creation_order(a, b));
    alive
        .into_iter()
        .take(diff as usize)
        .filter(|ms| {
            let observed = ms
                .status
                .as_ref()
                .and_then(|s| s.observed_generation)
                .unwrap_or(0);
            ms.spec.replicas == 0
                && ms.actual_replicas() == 0
                && ms.metadata.generation.unwrap_or(0) <= observed
        })
        .cloned()
        .collect()
}

/// Delete old MachineSets beyond the revision history limit
///
/// Sets that are already gone are ignored. Deleted sets are dropped from `pool`.
pub async fn cleanup_deployment(
    md: &MachineDeployment,
    pool: &mut MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let namespace = md.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let candidates = select_for_cleanup(&pool.old, md.revision_history_limit());

    if candidates.is_empty() {
        debug!(machinedeployment = ?md.name_any(), "No old MachineSets to clean up");
        return Ok(());
    }

    for ms in candidates {
        let name = ms.name_any();
        info!(
            machinedeployment = ?md.name_any(),
            machineset = ?name,
            "Deleting old MachineSet"
        );
        match ctx.store.delete_machine_set(&namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(machineset = ?name, "MachineSet already deleted");
            }
            Err(e) => return Err(e.into()),
        }
        pool.remove(&name);
    }

    Ok(())
}
