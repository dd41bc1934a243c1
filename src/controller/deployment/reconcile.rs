use super::cleanup::{cleanup_deployment, is_complete};
use super::machineset::{apply_scale_plan, is_owned_by, MachineSetPool};
use super::resolver::{classify_machine_sets, resolve_machine_sets};
use super::scaling::{is_scaling_event, plan_proportional_scale, Fenceposts};
use super::status::finish_pass;
use super::validation::validate_machine_deployment;
use crate::controller::clock::Clock;
use crate::controller::store::{ClusterStore, StoreError};
use crate::controller::strategies::in_place::rollout_in_place;
use crate::controller::strategies::select_strategy;
use crate::crd::machine_deployment::{MachineDeployment, StrategyType};
use crate::crd::machine_set::MachineSet;
use crate::server::SharedMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Requeue interval while an in-place upgrade is outstanding
pub const DEFAULT_IN_PLACE_POLL_INTERVAL: Duration = Duration::from_secs(15);

const REQUEUE_COMPLETE: Duration = Duration::from_secs(300);
const REQUEUE_PROGRESSING: Duration = Duration::from_secs(30);
const REQUEUE_CONFLICT: Duration = Duration::from_secs(2);
const REQUEUE_ERROR: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Cluster store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rollout incomplete: {0}")]
    RolloutIncomplete(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid MachineDeployment spec: {0}")]
    ValidationError(String),

    #[error("MachineDeployment missing namespace")]
    MissingNamespace,

    #[error("MachineDeployment missing name")]
    MissingName,

    #[error("Failed to serialize MachineTemplateSpec: {0}")]
    SerializationError(String),

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<ReconcileError>),
}

fn format_aggregate(errors: &[ReconcileError]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} errors: [{}]", errors.len(), messages.join("; "))
}

impl ReconcileError {
    /// Optimistic-concurrency failure anywhere in the error
    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_conflict(),
            ReconcileError::Aggregate(errors) => errors.iter().any(|e| e.is_conflict()),
            _ => false,
        }
    }

    /// Waiting on an external agent; an aggregate qualifies only if every member does
    pub fn is_rollout_incomplete(&self) -> bool {
        match self {
            ReconcileError::RolloutIncomplete(_) => true,
            ReconcileError::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(|e| e.is_rollout_incomplete())
            }
            _ => false,
        }
    }

    /// Transient failures that a later pass can get past
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(_) | ReconcileError::RolloutIncomplete(_) => true,
            ReconcileError::Aggregate(errors) => errors.iter().all(|e| e.is_retryable()),
            _ => false,
        }
    }
}

/// Combine the errors of independent steps
///
/// `None` entries are skipped; one error is returned as-is, several are
/// wrapped in [`ReconcileError::Aggregate`].
pub fn aggregate<I>(errors: I) -> Result<(), ReconcileError>
where
    I: IntoIterator<Item = Option<ReconcileError>>,
{
    let mut errors: Vec<ReconcileError> = errors.into_iter().flatten().collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ReconcileError::Aggregate(errors)),
    }
}

/// Backoff for a failed pass: conflicts retry quickly
pub fn requeue_after_error(error: &ReconcileError) -> Duration {
    if error.is_conflict() {
        REQUEUE_CONFLICT
    } else {
        REQUEUE_ERROR
    }
}

pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub clock: Arc<dyn Clock>,
    /// Optional controller metrics for Prometheus
    /// When Some, records reconciliation counts and durations
    pub metrics: Option<SharedMetrics>,
    pub in_place_poll_interval: Duration,
}

impl Context {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            store,
            clock,
            metrics,
            in_place_poll_interval: DEFAULT_IN_PLACE_POLL_INTERVAL,
        }
    }

    pub fn with_in_place_poll_interval(mut self, interval: Duration) -> Self {
        self.in_place_poll_interval = interval;
        self
    }

    /// Context backed by an in-memory store and a clock pinned to 2024-01-01
    #[cfg(test)]
    pub fn new_mock(store: Arc<crate::controller::store::MockStore>) -> Self {
        Context::new(
            store,
            Arc::new(crate::controller::clock::MockClock::at_epoch()),
            None,
        )
    }
}

/// MachineSets selected by the deployment's selector and controlled by it
pub async fn list_owned_machine_sets(
    md: &MachineDeployment,
    ctx: &Context,
) -> Result<Vec<MachineSet>, ReconcileError> {
    let namespace = md.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let sets = ctx
        .store
        .list_machine_sets(&namespace, &md.spec.selector)
        .await?;

    let total = sets.len();
    let owned: Vec<MachineSet> = sets.into_iter().filter(|ms| is_owned_by(ms, md)).collect();
    if owned.len() != total {
        debug!(
            machinedeployment = ?md.name_any(),
            skipped = total - owned.len(),
            "Ignoring selected MachineSets owned by another controller"
        );
    }
    Ok(owned)
}

/// Proportionally scale the existing MachineSets without starting a rollout
///
/// Used while paused and on scaling events. Never creates a MachineSet.
pub async fn sync_deployment(
    md: &mut MachineDeployment,
    sets: Vec<MachineSet>,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let mut pool = classify_machine_sets(&md.spec.template, sets);
    let outcome = scale_proportionally(md, &mut pool, ctx).await;
    finish_pass(outcome, md, &pool, ctx).await?;

    if is_complete(md) {
        cleanup_deployment(md, &mut pool, ctx).await?;
    }
    Ok(())
}

async fn scale_proportionally(
    md: &mut MachineDeployment,
    pool: &mut MachineSetPool,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    resolve_machine_sets(md, pool, false, ctx).await?;
    let fenceposts = Fenceposts::for_deployment(md)?;
    let plan = plan_proportional_scale(pool, md, fenceposts);
    apply_scale_plan(md, pool, &plan, fenceposts, ctx).await
}

/// Reconcile a MachineDeployment
///
/// 1. Validates the MachineDeployment spec
/// 2. Lists the MachineSets the deployment owns
/// 3. A pending in-place upgrade goes straight to the InPlace handler
/// 4. Paused deployments and scaling events are synced proportionally;
///    everything else goes to the strategy handler
///
/// # Returns
/// * `Ok(Action)` - Requeue after 300s when complete, 30s while progressing,
///   or the in-place poll interval while an upgrade is outstanding
/// * `Err(ReconcileError)` - Pass failed; `error_policy` picks the backoff
pub async fn reconcile(
    md: Arc<MachineDeployment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start_time = Instant::now();

    let namespace = md.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = md.metadata.name.clone().ok_or(ReconcileError::MissingName)?;

    if md.metadata.deletion_timestamp.is_some() {
        debug!(machinedeployment = ?name, "MachineDeployment is being deleted, skipping");
        if let Some(ref metrics) = ctx.metrics {
            metrics.forget_deployment(&namespace, &name);
        }
        return Ok(Action::await_change());
    }

    info!(
        machinedeployment = ?name,
        namespace = ?namespace,
        "Reconciling MachineDeployment"
    );

    let strategy = select_strategy(&md);

    if let Err(validation_error) = validate_machine_deployment(&md) {
        error!(
            machinedeployment = ?name,
            error = ?validation_error,
            "MachineDeployment spec validation failed"
        );
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_error(strategy.name(), start_time.elapsed().as_secs_f64());
        }
        return Err(ReconcileError::ValidationError(validation_error));
    }

    let result = run_pass(&md, &ctx).await;
    let duration = start_time.elapsed().as_secs_f64();

    match result {
        Ok(updated) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_reconciliation_success(strategy.name(), duration);
                metrics.set_in_place_pending(&namespace, &name, updated.has_in_place_annotation());
            }
            let requeue = if is_complete(&updated) {
                REQUEUE_COMPLETE
            } else {
                REQUEUE_PROGRESSING
            };
            debug!(
                machinedeployment = ?name,
                requeue_secs = requeue.as_secs(),
                "Reconcile pass finished"
            );
            Ok(Action::requeue(requeue))
        }
        Err(e) if e.is_rollout_incomplete() => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_rollout_incomplete(strategy.name(), duration);
                metrics.set_in_place_pending(&namespace, &name, true);
            }
            info!(
                machinedeployment = ?name,
                reason = %e,
                poll_secs = ctx.in_place_poll_interval.as_secs(),
                "Waiting for in-place upgrade"
            );
            Ok(Action::requeue(ctx.in_place_poll_interval))
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_reconciliation_error(strategy.name(), duration);
            }
            if e.is_conflict() {
                warn!(machinedeployment = ?name, error = %e, "Conflicting write, will retry");
            }
            Err(e)
        }
    }
}

/// One pass over a copy of the deployment; returns the copy as last written
async fn run_pass(
    md: &MachineDeployment,
    ctx: &Context,
) -> Result<MachineDeployment, ReconcileError> {
    let sets = list_owned_machine_sets(md, ctx).await?;
    let mut md = md.clone();

    if md.spec.strategy.strategy_type == StrategyType::InPlace && md.has_in_place_annotation() {
        // nothing is scaled until the pending upgrade is settled
        debug!(machinedeployment = ?md.name_any(), "In-place upgrade pending");
        rollout_in_place(&mut md, sets, ctx).await?;
    } else if md.spec.paused {
        info!(machinedeployment = ?md.name_any(), "MachineDeployment is paused, syncing scale only");
        sync_deployment(&mut md, sets, ctx).await?;
    } else if is_scaling_event(&sets, &md) {
        info!(
            machinedeployment = ?md.name_any(),
            replicas = md.spec.replicas,
            "Scaling event detected"
        );
        sync_deployment(&mut md, sets, ctx).await?;
    } else {
        let strategy = select_strategy(&md);
        debug!(machinedeployment = ?md.name_any(), strategy = strategy.name(), "Rolling out");
        strategy.rollout(&mut md, sets, ctx).await?;
    }

    Ok(md)
}
