//! InPlace strategy
//!
//! Machines are upgraded by an external agent; no replacement MachineSet is
//! created once the deployment has one. The controller marks the deployment
//! with the in-place annotation, waits until a MachineSet carries the current
//! template, then clears the annotation and hands every replica to that set.

use super::RolloutStrategy;
use crate::controller::deployment::{
    apply_scale_plan, classify_machine_sets, cleanup_deployment, finish_pass, is_complete,
    plan_full_handoff, resolve_machine_sets, Context, Fenceposts, MachineSetPool, ReconcileError,
};
use crate::crd::machine_deployment::{MachineDeployment, IN_PLACE_UPGRADE_ANNOTATION};
use crate::crd::machine_set::MachineSet;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// In-place state persisted on the deployment through the annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InPlaceState {
    Stable,
    AwaitingUpgrade,
}

impl InPlaceState {
    pub fn of(md: &MachineDeployment) -> Self {
        if md.has_in_place_annotation() {
            InPlaceState::AwaitingUpgrade
        } else {
            InPlaceState::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Template changed: set the annotation and wait
    BeginUpgrade,
    /// Upgrade requested, no MachineSet carries the template yet
    StillAwaiting,
    /// The agent finished: clear the annotation and hand off
    UpgradeCompleted,
    /// Nothing outstanding: keep the matching set at full size
    Steady,
}

/// Transition for the current state and whether a MachineSet matches the template
pub fn next_transition(state: InPlaceState, has_matching_set: bool) -> Transition {
    match (state, has_matching_set) {
        (InPlaceState::Stable, false) => Transition::BeginUpgrade,
        (InPlaceState::AwaitingUpgrade, false) => Transition::StillAwaiting,
        (InPlaceState::AwaitingUpgrade, true) => Transition::UpgradeCompleted,
        (InPlaceState::Stable, true) => Transition::Steady,
    }
}

pub struct InPlaceStrategyHandler;

#[async_trait]
impl RolloutStrategy for InPlaceStrategyHandler {
    fn name(&self) -> &'static str {
        "InPlace"
    }

    async fn rollout(
        &self,
        md: &mut MachineDeployment,
        sets: Vec<MachineSet>,
        ctx: &Context,
    ) -> Result<(), ReconcileError> {
        rollout_in_place(md, sets, ctx).await
    }
}

/// One in-place pass
///
/// A deployment with no MachineSets is bootstrapped with one. Status is
/// synced on every pass; while the upgrade is outstanding the pass ends
/// with [`ReconcileError::RolloutIncomplete`].
pub async fn rollout_in_place(
    md: &mut MachineDeployment,
    sets: Vec<MachineSet>,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let mut pool = classify_machine_sets(&md.spec.template, sets);
    let outcome = coordinate(md, &mut pool, ctx).await;
    finish_pass(outcome, md, &pool, ctx).await?;

    if is_complete(md) {
        cleanup_deployment(md, &mut pool, ctx).await?;
    }
    Ok(())
}

async fn coordinate(
    md: &mut MachineDeployment,
    pool: &mut MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let bootstrap = pool.is_empty();
    resolve_machine_sets(md, pool, bootstrap, ctx).await?;

    let state = InPlaceState::of(md);
    let transition = next_transition(state, pool.new.is_some());
    debug!(
        machinedeployment = ?md.name_any(),
        state = ?state,
        transition = ?transition,
        "In-place transition"
    );

    match transition {
        Transition::BeginUpgrade => {
            info!(
                machinedeployment = ?md.name_any(),
                "Template changed, requesting in-place upgrade"
            );
            set_upgrade_annotation(md, Some("true".to_string()), ctx).await?;
            Err(ReconcileError::RolloutIncomplete(
                "in-place upgrade requested".to_string(),
            ))
        }
        Transition::StillAwaiting => Err(ReconcileError::RolloutIncomplete(
            "waiting for in-place upgrade".to_string(),
        )),
        Transition::UpgradeCompleted => {
            info!(
                machinedeployment = ?md.name_any(),
                "In-place upgrade completed"
            );
            set_upgrade_annotation(md, None, ctx).await?;
            hand_off(md, pool, ctx).await
        }
        Transition::Steady => hand_off(md, pool, ctx).await,
    }
}

/// Give every replica to the matching set and drain the rest
async fn hand_off(
    md: &MachineDeployment,
    pool: &mut MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let fenceposts = Fenceposts::for_deployment(md)?;
    let plan = plan_full_handoff(pool.new.as_ref(), &pool.old, md.spec.replicas);
    apply_scale_plan(md, pool, &plan, fenceposts, ctx).await
}

/// Set (`Some`) or remove (`None`) the in-place annotation on the deployment
pub(crate) async fn set_upgrade_annotation(
    md: &mut MachineDeployment,
    value: Option<String>,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let annotations = BTreeMap::from([(IN_PLACE_UPGRADE_ANNOTATION.to_string(), value)]);
    *md = ctx
        .store
        .patch_deployment_annotations(md, &annotations)
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::deployment::fixtures::{in_place_deployment, machine_set, template};
    use crate::controller::store::{MockStore, StoreWrite};
    use std::sync::Arc;

    fn setup(md: MachineDeployment) -> (Arc<MockStore>, Context, MachineDeployment) {
        let store = Arc::new(MockStore::new());
        store.insert_deployment(md);
        let ctx = Context::new_mock(store.clone());
        let md = store.deployment("workers").unwrap();
        (store, ctx, md)
    }

    #[test]
    fn test_transition_table() {
        use InPlaceState::*;
        assert_eq!(next_transition(Stable, false), Transition::BeginUpgrade);
        assert_eq!(next_transition(AwaitingUpgrade, false), Transition::StillAwaiting);
        assert_eq!(next_transition(AwaitingUpgrade, true), Transition::UpgradeCompleted);
        assert_eq!(next_transition(Stable, true), Transition::Steady);
    }

    #[test]
    fn test_state_follows_annotation() {
        let mut md = in_place_deployment(3, "v1.29.0");
        assert_eq!(InPlaceState::of(&md), InPlaceState::Stable);

        md.annotations_mut()
            .insert(IN_PLACE_UPGRADE_ANNOTATION.to_string(), "true".to_string());
        assert_eq!(InPlaceState::of(&md), InPlaceState::AwaitingUpgrade);
    }

    #[tokio::test]
    async fn test_bootstrap_creates_and_fills_machine_set() {
        let (store, ctx, mut md) = setup(in_place_deployment(3, "v1.29.0"));

        rollout_in_place(&mut md, Vec::new(), &ctx).await.unwrap();

        let sets = store.machine_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].spec.replicas, 3);
        assert!(!md.has_in_place_annotation());
    }

    #[tokio::test]
    async fn test_template_change_requests_upgrade_then_waits() {
        let (store, ctx, mut md) = setup(in_place_deployment(3, "v1.29.0"));
        store.insert_machine_set(machine_set("workers-a", 3, 3, 0));

        let err = rollout_in_place(&mut md, store.machine_sets(), &ctx)
            .await
            .unwrap_err();

        assert!(err.is_rollout_incomplete());
        assert!(md.has_in_place_annotation());
        assert_eq!(
            store.writes(),
            vec![
                StoreWrite::PatchAnnotations("workers".to_string()),
                StoreWrite::PatchStatus("workers".to_string()),
            ]
        );
        // no replacement set while the agent works
        assert_eq!(store.machine_sets().len(), 1);

        store.clear_writes();
        let mut md = store.deployment("workers").unwrap();
        let err = rollout_in_place(&mut md, store.machine_sets(), &ctx)
            .await
            .unwrap_err();

        assert!(err.is_rollout_incomplete());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_completed_clears_annotation() {
        let (store, ctx, _) = setup(in_place_deployment(3, "v1.29.0"));
        let mut upgraded = machine_set("workers-a", 3, 3, 0);
        upgraded.spec.template = template("v1.29.0");
        store.insert_machine_set(upgraded);

        let mut md = store.deployment("workers").unwrap();
        md.annotations_mut()
            .insert(IN_PLACE_UPGRADE_ANNOTATION.to_string(), "true".to_string());
        store.insert_deployment(md);
        let mut md = store.deployment("workers").unwrap();

        rollout_in_place(&mut md, store.machine_sets(), &ctx)
            .await
            .unwrap();

        assert!(!md.has_in_place_annotation());
        assert!(!store.deployment("workers").unwrap().has_in_place_annotation());
        assert_eq!(store.machine_set("workers-a").unwrap().spec.replicas, 3);
    }
}
