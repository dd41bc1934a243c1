//! Strategy handlers for MachineDeployment rollouts
//!
//! - RollingUpdateStrategyHandler: new MachineSet, replicas shifted within surge/unavailable budgets
//! - InPlaceStrategyHandler: an external agent upgrades machines, the controller waits and hands off

pub mod in_place;
pub mod rolling;

use crate::controller::deployment::{Context, ReconcileError};
use crate::crd::machine_deployment::{MachineDeployment, StrategyType};
use crate::crd::machine_set::MachineSet;
use async_trait::async_trait;

/// Strategy trait for MachineDeployment rollouts
///
/// A handler owns one full pass: resolve the MachineSets, scale them, sync
/// status, and clean up once the rollout is complete. Implementations must
/// be idempotent.
#[async_trait]
pub trait RolloutStrategy: Send + Sync {
    /// Strategy name for logging and metrics
    fn name(&self) -> &'static str;

    /// Drive `sets` toward the deployment's desired state
    ///
    /// # Arguments
    /// * `md` - The deployment; replaced by the latest written copy
    /// * `sets` - MachineSets owned by the deployment
    /// * `ctx` - Controller context
    ///
    /// # Returns
    /// * `Ok(())` - Pass finished
    /// * `Err(ReconcileError::RolloutIncomplete)` - Waiting on an external agent
    /// * `Err(ReconcileError)` - Pass failed
    async fn rollout(
        &self,
        md: &mut MachineDeployment,
        sets: Vec<MachineSet>,
        ctx: &Context,
    ) -> Result<(), ReconcileError>;
}

/// Select the strategy handler for a MachineDeployment
pub fn select_strategy(md: &MachineDeployment) -> Box<dyn RolloutStrategy> {
    use crate::controller::strategies::{
        in_place::InPlaceStrategyHandler, rolling::RollingUpdateStrategyHandler,
    };

    match md.spec.strategy.strategy_type {
        StrategyType::RollingUpdate => Box::new(RollingUpdateStrategyHandler),
        StrategyType::InPlace => Box::new(InPlaceStrategyHandler),
    }
}
