//! RollingUpdate strategy
//!
//! A MachineSet is created for every new template and replicas move from the
//! old sets to the new one a step per pass, bounded by maxSurge and
//! maxUnavailable.

use super::RolloutStrategy;
use super::in_place::set_upgrade_annotation;
use crate::controller::deployment::{
    apply_scale_plan, classify_machine_sets, cleanup_deployment, finish_pass, is_complete,
    plan_rolling_update, resolve_machine_sets, Context, Fenceposts, MachineSetPool,
    ReconcileError,
};
use crate::crd::machine_deployment::MachineDeployment;
use crate::crd::machine_set::MachineSet;
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

pub struct RollingUpdateStrategyHandler;

#[async_trait]
impl RolloutStrategy for RollingUpdateStrategyHandler {
    fn name(&self) -> &'static str {
        "RollingUpdate"
    }

    async fn rollout(
        &self,
        md: &mut MachineDeployment,
        sets: Vec<MachineSet>,
        ctx: &Context,
    ) -> Result<(), ReconcileError> {
        rollout_rolling_update(md, sets, ctx).await
    }
}

/// One rolling-update pass
///
/// Creates the new MachineSet if needed, applies one scaling step, always
/// syncs status, and deletes surplus old sets once the rollout completes.
pub async fn rollout_rolling_update(
    md: &mut MachineDeployment,
    sets: Vec<MachineSet>,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let mut pool = classify_machine_sets(&md.spec.template, sets);
    let outcome = scale_step(md, &mut pool, ctx).await;
    finish_pass(outcome, md, &pool, ctx).await?;

    if is_complete(md) {
        cleanup_deployment(md, &mut pool, ctx).await?;
    }
    Ok(())
}

async fn scale_step(
    md: &mut MachineDeployment,
    pool: &mut MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    if md.has_in_place_annotation() {
        info!(
            machinedeployment = ?md.name_any(),
            "Clearing in-place upgrade annotation left from the InPlace strategy"
        );
        set_upgrade_annotation(md, None, ctx).await?;
    }

    resolve_machine_sets(md, pool, true, ctx).await?;

    let fenceposts = Fenceposts::for_deployment(md)?;
    let plan = plan_rolling_update(
        pool.new.as_ref(),
        &pool.old,
        md.spec.replicas,
        fenceposts.max_surge,
        fenceposts.max_unavailable,
    )?;
    debug!(
        machinedeployment = ?md.name_any(),
        max_surge = fenceposts.max_surge,
        max_unavailable = fenceposts.max_unavailable,
        planned = plan.intents.len(),
        "Planned rolling update step"
    );

    apply_scale_plan(md, pool, &plan, fenceposts, ctx).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::deployment::fixtures::{machine_set, rolling_deployment, template};
    use crate::controller::store::{MockStore, StoreWrite};
    use crate::crd::machine_deployment::IN_PLACE_UPGRADE_ANNOTATION;
    use crate::crd::template::{ConditionStatus, ConditionType};
    use std::sync::Arc;

    fn setup(md: MachineDeployment) -> (Arc<MockStore>, Context, MachineDeployment) {
        let store = Arc::new(MockStore::new());
        store.insert_deployment(md);
        let ctx = Context::new_mock(store.clone());
        let md = store.deployment("workers").unwrap();
        (store, ctx, md)
    }

    #[tokio::test]
    async fn test_first_pass_creates_new_set_and_surges() {
        let (store, ctx, mut md) = setup(rolling_deployment(3, "v1.29.0", "1", "0"));
        store.insert_machine_set(machine_set("workers-old", 3, 3, 0));

        rollout_rolling_update(&mut md, store.machine_sets(), &ctx)
            .await
            .unwrap();

        let sets = store.machine_sets();
        assert_eq!(sets.len(), 2);
        let new = sets
            .iter()
            .find(|ms| ms.spec.template.matches(&template("v1.29.0")))
            .unwrap();
        assert_eq!(new.spec.replicas, 1);
        // nothing new is available yet, old keeps its machines
        assert_eq!(store.machine_set("workers-old").unwrap().spec.replicas, 3);

        let status = md.status.unwrap();
        assert_eq!(status.replicas, 3);
        assert_eq!(status.updated_replicas, 0);
    }

    #[tokio::test]
    async fn test_failed_scale_still_syncs_status() {
        let (store, ctx, mut md) = setup(rolling_deployment(2, "v1.29.0", "1", "0"));
        store.insert_machine_set(machine_set("workers-a", 2, 2, 0));
        let sets = store.machine_sets();
        // creating the new set loses a write race
        store.conflict_next_write();

        let err = rollout_rolling_update(&mut md, sets, &ctx)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(store
            .writes()
            .contains(&StoreWrite::PatchStatus("workers".to_string())));
    }

    #[tokio::test]
    async fn test_strategy_switch_clears_in_place_annotation() {
        let mut md = rolling_deployment(2, "v1.29.0", "1", "0");
        md.annotations_mut()
            .insert(IN_PLACE_UPGRADE_ANNOTATION.to_string(), "true".to_string());
        let (store, ctx, mut md) = setup(md);
        store.insert_machine_set(machine_set("workers-old", 2, 2, 0));

        rollout_rolling_update(&mut md, store.machine_sets(), &ctx)
            .await
            .unwrap();

        assert!(!md.has_in_place_annotation());
        let stored = store.deployment("workers").unwrap();
        assert!(!stored.has_in_place_annotation());

        let progressing = stored
            .status
            .unwrap()
            .conditions
            .into_iter()
            .find(|c| c.type_ == ConditionType::Progressing)
            .unwrap();
        assert_eq!(progressing.status, ConditionStatus::True);
        assert_ne!(progressing.reason, "InPlaceUpgradePending");
    }
}
