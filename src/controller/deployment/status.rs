use super::cleanup::status_is_complete;
use super::machineset::MachineSetPool;
use super::reconcile::{aggregate, Context, ReconcileError};
use super::scaling::Fenceposts;
use crate::controller::store::selector_to_string;
use crate::crd::machine_deployment::{MachineDeployment, MachineDeploymentStatus, Phase};
use crate::crd::template::{Condition, ConditionStatus, ConditionType};
use kube::ResourceExt;
use tracing::{debug, info};

/// Compute the status of a deployment from its MachineSets
///
/// Counts are summed from the sets' reported status; `updatedReplicas` comes
/// from the new set. Conditions keep their `lastTransitionTime` while their
/// status is unchanged.
///
/// # Arguments
/// * `md` - The deployment (its current status supplies previous phase/conditions)
/// * `pool` - The deployment's MachineSets after this pass's writes
/// * `fenceposts` - Resolved budgets (for the Available condition)
/// * `now` - RFC3339 timestamp for conditions that transition
pub fn calculate_status(
    md: &MachineDeployment,
    pool: &MachineSetPool,
    fenceposts: Fenceposts,
    now: &str,
) -> MachineDeploymentStatus {
    let desired = md.spec.replicas;
    let spec_total: i32 = pool.all().map(|ms| ms.spec.replicas).sum();
    let available: i32 = pool.all().map(|ms| ms.available_replicas()).sum();

    let mut status = MachineDeploymentStatus {
        observed_generation: md.metadata.generation,
        selector: Some(selector_to_string(&md.spec.selector)),
        replicas: pool.all().map(|ms| ms.actual_replicas()).sum(),
        updated_replicas: pool.new.as_ref().map(|ms| ms.actual_replicas()).unwrap_or(0),
        ready_replicas: pool.all().map(|ms| ms.ready_replicas()).sum(),
        available_replicas: available,
        unavailable_replicas: (spec_total - available).max(0),
        phase: None,
        conditions: Vec::new(),
    };

    let previous = md.status.as_ref();
    status.phase = compute_phase(desired, &status, pool, previous.and_then(|s| s.phase.clone()));

    let previous_conditions = previous.map(|s| s.conditions.as_slice()).unwrap_or(&[]);
    let mut conditions = vec![
        available_condition(desired, available, fenceposts),
        progressing_condition(md, &status),
    ];
    if let Some(failure) = replica_failure_condition(pool) {
        conditions.push(failure);
    }
    status.conditions = conditions
        .into_iter()
        .map(|c| with_transition_time(c, previous_conditions, now))
        .collect();

    status
}

/// Coarse phase, later rules taking precedence
///
/// ScalingUp / ScalingDown by replica count, Running once every desired
/// machine is ready, Failed when any set reports a failure. Otherwise the
/// previous phase is kept.
fn compute_phase(
    desired: i32,
    status: &MachineDeploymentStatus,
    pool: &MachineSetPool,
    previous: Option<Phase>,
) -> Option<Phase> {
    let mut phase = previous;
    if status.replicas < desired {
        phase = Some(Phase::ScalingUp);
    }
    if status.replicas > desired {
        phase = Some(Phase::ScalingDown);
    }
    if status.ready_replicas == desired {
        phase = Some(Phase::Running);
    }
    if first_failure(pool).is_some() {
        phase = Some(Phase::Failed);
    }
    phase
}

fn available_condition(desired: i32, available: i32, fenceposts: Fenceposts) -> Condition {
    let minimum = desired - fenceposts.max_unavailable;
    let (status, reason) = if available >= minimum {
        (ConditionStatus::True, "MinimumReplicasAvailable")
    } else {
        (ConditionStatus::False, "MinimumReplicasUnavailable")
    };
    Condition {
        type_: ConditionType::Available,
        status,
        reason: reason.to_string(),
        message: format!("{available} of {minimum} required machines available"),
        last_transition_time: None,
    }
}

fn progressing_condition(md: &MachineDeployment, status: &MachineDeploymentStatus) -> Condition {
    let (status, reason, message) = if status_is_complete(md, status) {
        (
            ConditionStatus::True,
            "NewMachineSetAvailable",
            "MachineDeployment has successfully progressed",
        )
    } else if md.has_in_place_annotation() {
        (
            ConditionStatus::False,
            "InPlaceUpgradePending",
            "Waiting for machines to be upgraded in place",
        )
    } else if md.spec.paused {
        (
            ConditionStatus::Unknown,
            "DeploymentPaused",
            "MachineDeployment is paused",
        )
    } else {
        (
            ConditionStatus::True,
            "MachineSetUpdated",
            "MachineSets are being scaled",
        )
    };
    Condition {
        type_: ConditionType::Progressing,
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: None,
    }
}

fn first_failure(pool: &MachineSetPool) -> Option<(String, String)> {
    pool.all().find_map(|ms| {
        let status = ms.status.as_ref()?;
        let reason = status.failure_reason.clone()?;
        Some((reason, status.failure_message.clone().unwrap_or_default()))
    })
}

fn replica_failure_condition(pool: &MachineSetPool) -> Option<Condition> {
    first_failure(pool).map(|(reason, message)| Condition {
        type_: ConditionType::ReplicaFailure,
        status: ConditionStatus::True,
        reason,
        message,
        last_transition_time: None,
    })
}

/// Carry over the previous transition time when the condition status is unchanged
fn with_transition_time(mut condition: Condition, previous: &[Condition], now: &str) -> Condition {
    let unchanged = previous
        .iter()
        .find(|c| c.type_ == condition.type_)
        .filter(|c| c.status == condition.status);
    condition.last_transition_time = match unchanged {
        Some(c) => c.last_transition_time.clone(),
        None => Some(now.to_string()),
    };
    condition
}

/// Recompute and persist the deployment status
///
/// The status subresource is patched only when it changed; on success `md`
/// is replaced by the patched copy.
pub async fn sync_status(
    md: &mut MachineDeployment,
    pool: &MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let fenceposts = Fenceposts::for_deployment(md)?;
    let status = calculate_status(md, pool, fenceposts, &ctx.clock.now_rfc3339());

    if md.status.as_ref() == Some(&status) {
        debug!(machinedeployment = ?md.name_any(), "Status unchanged");
        return Ok(());
    }

    info!(
        machinedeployment = ?md.name_any(),
        replicas = status.replicas,
        updated = status.updated_replicas,
        available = status.available_replicas,
        phase = ?status.phase,
        "Updating MachineDeployment status"
    );
    *md = ctx.store.patch_deployment_status(md, &status).await?;
    Ok(())
}

/// Finish a reconcile pass: always sync status, then report both outcomes
///
/// A successful status sync never hides a failure of the primary path.
pub async fn finish_pass(
    outcome: Result<(), ReconcileError>,
    md: &mut MachineDeployment,
    pool: &MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let synced = sync_status(md, pool, ctx).await;
    aggregate([outcome.err(), synced.err()])
}
