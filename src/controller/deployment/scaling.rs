use super::machineset::{creation_order, MachineSetPool};
use super::reconcile::ReconcileError;
use crate::crd::machine_deployment::{MachineDeployment, StrategyType};
use crate::crd::machine_set::MachineSet;
use kube::ResourceExt;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Default maxSurge when the strategy leaves it unset
pub const DEFAULT_MAX_SURGE: &str = "1";

/// Default maxUnavailable when the strategy leaves it unset
pub const DEFAULT_MAX_UNAVAILABLE: &str = "0";

/// Resolved absolute rollout budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fenceposts {
    pub max_surge: i32,
    pub max_unavailable: i32,
}

impl Fenceposts {
    /// Budgets of a deployment's rolling strategy (defaults applied)
    pub fn for_deployment(md: &MachineDeployment) -> Result<Fenceposts, ReconcileError> {
        let params = md.spec.strategy.rolling_update.as_ref();
        let max_surge = params
            .and_then(|p| p.max_surge.as_deref())
            .unwrap_or(DEFAULT_MAX_SURGE);
        let max_unavailable = params
            .and_then(|p| p.max_unavailable.as_deref())
            .unwrap_or(DEFAULT_MAX_UNAVAILABLE);
        let fenceposts = resolve_fenceposts(max_surge, max_unavailable, md.spec.replicas)?;
        fenceposts.max_replicas(md.spec.replicas)?;
        Ok(fenceposts)
    }

    /// `desired + max_surge`, the most machines a rollout may run at once
    ///
    /// # Errors
    /// `InvariantViolation` when the sum does not fit in an i32
    pub fn max_replicas(&self, desired: i32) -> Result<i32, ReconcileError> {
        desired.checked_add(self.max_surge).ok_or_else(|| {
            ReconcileError::InvariantViolation(format!(
                "replicas {desired} + maxSurge {} overflows",
                self.max_surge
            ))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Rounding {
    Up,
    Down,
}

/// Parse a budget value (percentage like "25%" or absolute like "5")
///
/// Percentages are taken of `desired` and rounded as requested.
/// Returns None for negative, out of range (>100%), or malformed values.
fn parse_budget(value: &str, desired: i32, rounding: Rounding) -> Option<i32> {
    if let Some(percent_str) = value.strip_suffix('%') {
        let percent = percent_str.parse::<i32>().ok()?;
        if !(0..=100).contains(&percent) {
            return None;
        }
        let exact = (desired as f64 * percent as f64) / 100.0;
        Some(match rounding {
            Rounding::Up => exact.ceil() as i32,
            Rounding::Down => exact.floor() as i32,
        })
    } else {
        value.parse::<i32>().ok().filter(|abs| *abs >= 0)
    }
}

/// Resolve maxSurge / maxUnavailable into absolute numbers
///
/// maxSurge percentages round up, maxUnavailable percentages round down.
/// If both resolve to 0, maxUnavailable becomes 1 so the rollout can progress.
///
/// # Errors
/// `InvariantViolation` when either value is malformed
///
/// # Examples
/// ```ignore
/// let f = resolve_fenceposts("25%", "25%", 10)?;
/// assert_eq!((f.max_surge, f.max_unavailable), (3, 2));
/// ```
pub fn resolve_fenceposts(
    max_surge: &str,
    max_unavailable: &str,
    desired: i32,
) -> Result<Fenceposts, ReconcileError> {
    let surge = parse_budget(max_surge, desired, Rounding::Up).ok_or_else(|| {
        ReconcileError::InvariantViolation(format!("invalid maxSurge: {max_surge}"))
    })?;
    let unavailable = parse_budget(max_unavailable, desired, Rounding::Down).ok_or_else(|| {
        ReconcileError::InvariantViolation(format!("invalid maxUnavailable: {max_unavailable}"))
    })?;

    if surge == 0 && unavailable == 0 {
        return Ok(Fenceposts {
            max_surge: 0,
            max_unavailable: 1,
        });
    }

    Ok(Fenceposts {
        max_surge: surge,
        max_unavailable: unavailable,
    })
}

/// Target replica counts for the MachineSets whose size should change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub intents: BTreeMap<String, i32>,
}

impl ScalePlan {
    /// Record `target` for `ms` unless it is already at that size
    fn set(&mut self, ms: &MachineSet, target: i32) {
        if ms.spec.replicas == target {
            self.intents.remove(&ms.name_any());
        } else {
            self.intents.insert(ms.name_any(), target);
        }
    }

    /// Planned size of `ms` (its current size when unplanned)
    pub fn target(&self, ms: &MachineSet) -> i32 {
        self.intents
            .get(&ms.name_any())
            .copied()
            .unwrap_or(ms.spec.replicas)
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

/// Plan one step of a rolling update
///
/// The new set is scaled first (up within `desired + max_surge`, or down to
/// `desired`). Old sets are then scaled down, oldest first, never below
/// `desired - max_unavailable` available machines: unhealthy replicas are
/// removed before available ones. Old sets are never scaled up.
///
/// # Arguments
/// * `new` - MachineSet matching the current template, if any
/// * `old` - Remaining MachineSets, oldest first
/// * `desired` - `spec.replicas` of the deployment
/// * `max_surge` / `max_unavailable` - Resolved absolute budgets
///
/// # Errors
/// `InvariantViolation` when `desired` or a budget is negative
pub fn plan_rolling_update(
    new: Option<&MachineSet>,
    old: &[MachineSet],
    desired: i32,
    max_surge: i32,
    max_unavailable: i32,
) -> Result<ScalePlan, ReconcileError> {
    if desired < 0 || max_surge < 0 || max_unavailable < 0 {
        return Err(ReconcileError::InvariantViolation(format!(
            "negative scale input: desired={desired} maxSurge={max_surge} maxUnavailable={max_unavailable}"
        )));
    }

    let max_total = desired.checked_add(max_surge).ok_or_else(|| {
        ReconcileError::InvariantViolation(format!(
            "replicas {desired} + maxSurge {max_surge} overflows"
        ))
    })?;

    let mut plan = ScalePlan::default();
    let old_total: i32 = old.iter().map(|ms| ms.spec.replicas).sum();

    // Scale the new set
    let new_replicas = match new {
        Some(ms) => {
            let current = ms.spec.replicas;
            let target = if current > desired {
                desired
            } else {
                let current_total = old_total + current;
                if current_total < max_total {
                    current + (max_total - current_total).min(desired - current)
                } else {
                    current
                }
            };
            plan.set(ms, target);
            target
        }
        None => 0,
    };

    if old_total == 0 {
        return Ok(plan);
    }

    // Scale old sets down, using the new set's post-scale size
    let min_available = desired - max_unavailable;
    let new_unavailable = new
        .map(|ms| (new_replicas - ms.available_replicas()).max(0))
        .unwrap_or(0);
    let all_total = old_total + new_replicas;
    let max_scaled_down = all_total - min_available - new_unavailable;
    if max_scaled_down <= 0 {
        return Ok(plan);
    }

    let mut old_targets: Vec<i32> = old.iter().map(|ms| ms.spec.replicas).collect();

    // Stage 1: drop unhealthy replicas first
    let mut cleaned = 0;
    for (ms, target) in old.iter().zip(old_targets.iter_mut()) {
        if cleaned >= max_scaled_down {
            break;
        }
        let unhealthy = (*target - ms.available_replicas()).max(0);
        if *target == 0 || unhealthy == 0 {
            continue;
        }
        let count = unhealthy.min(max_scaled_down - cleaned);
        *target -= count;
        cleaned += count;
    }

    // Stage 2: remove available replicas while staying above the floor
    let available_total: i32 = new
        .into_iter()
        .chain(old.iter())
        .map(|ms| ms.available_replicas())
        .sum();
    if available_total > min_available {
        let total_scale_down = available_total - min_available;
        let mut scaled = 0;
        for target in old_targets.iter_mut() {
            if scaled >= total_scale_down {
                break;
            }
            if *target == 0 {
                continue;
            }
            let count = (*target).min(total_scale_down - scaled);
            *target -= count;
            scaled += count;
        }
    }

    for (ms, target) in old.iter().zip(old_targets) {
        plan.set(ms, target);
    }

    Ok(plan)
}

/// Plan the in-place handoff: the new set takes every replica, old sets go to 0
pub fn plan_full_handoff(new: Option<&MachineSet>, old: &[MachineSet], desired: i32) -> ScalePlan {
    let mut plan = ScalePlan::default();
    if let Some(ms) = new {
        plan.set(ms, desired);
    }
    for ms in old.iter().filter(|ms| ms.is_active()) {
        plan.set(ms, 0);
    }
    plan
}

/// True when `spec.replicas` changed since the active sets were last scaled
///
/// Sets without a desired-replicas annotation never count.
pub fn is_scaling_event(sets: &[MachineSet], md: &MachineDeployment) -> bool {
    sets.iter()
        .filter(|ms| ms.is_active())
        .filter_map(|ms| ms.desired_replicas_annotation())
        .any(|desired| desired != md.spec.replicas)
}

/// The single active set, or the newest set when none is active
///
/// Returns None when several sets are active.
fn find_one_active_or_latest<'a>(
    new: Option<&'a MachineSet>,
    old: &'a [MachineSet],
) -> Option<&'a MachineSet> {
    let mut newest_first: Vec<&MachineSet> = old.iter().collect();
    newest_first.sort_by(|a, b| creation_order(b, a));

    let active: Vec<&MachineSet> = newest_first
        .iter()
        .copied()
        .chain(new)
        .filter(|ms| ms.is_active())
        .collect();

    match active.len() {
        0 => new.or_else(|| newest_first.first().copied()),
        1 => Some(active[0]),
        _ => None,
    }
}

/// New set has every desired replica and all of them are available
fn is_saturated(md: &MachineDeployment, new: &MachineSet) -> bool {
    let desired = md.spec.replicas;
    new.spec.replicas == desired
        && new.desired_replicas_annotation() == Some(desired)
        && new.available_replicas() == desired
}

/// Share of `to_add - added` that `ms` should receive
fn proportion(
    ms: &MachineSet,
    md: &MachineDeployment,
    max_surge: i32,
    to_add: i32,
    added: i32,
) -> i32 {
    if ms.spec.replicas == 0 || to_add == 0 || to_add == added {
        return 0;
    }

    let fraction = set_fraction(ms, md, max_surge);
    let allowed = to_add - added;
    if to_add > 0 {
        fraction.min(allowed)
    } else {
        fraction.max(allowed)
    }
}

/// Replicas to add to `ms` so it keeps its share of the resized deployment
fn set_fraction(ms: &MachineSet, md: &MachineDeployment, max_surge: i32) -> i32 {
    if md.spec.replicas == 0 {
        return -ms.spec.replicas;
    }

    let deployment_replicas = md.spec.replicas.saturating_add(max_surge);
    let annotated = ms
        .max_replicas_annotation()
        .unwrap_or_else(|| md.status.as_ref().map(|s| s.replicas).unwrap_or(0));
    if annotated <= 0 {
        return 0;
    }

    let new_size = (ms.spec.replicas as f64 * deployment_replicas as f64) / annotated as f64;
    new_size.round() as i32 - ms.spec.replicas
}

/// Size descending; ties go to the newer set (`newer_first`) or the older one
fn by_size(a: &MachineSet, b: &MachineSet, newer_first: bool) -> Ordering {
    b.spec.replicas.cmp(&a.spec.replicas).then_with(|| {
        if newer_first {
            creation_order(b, a)
        } else {
            creation_order(a, b)
        }
    })
}

/// Plan proportional scaling for paused deployments and scaling events
///
/// - One active set (or none): it, or the newest set, takes `spec.replicas`.
/// - Saturated new set: active old sets go to 0.
/// - RollingUpdate with several active sets: the difference between
///   `spec.replicas + max_surge` and the current total is spread across the
///   active sets in proportion to their size, leftovers to the first set.
///
/// Old sets never grow: growth planned for an old set goes to the new set,
/// or is dropped when there is none.
pub fn plan_proportional_scale(
    pool: &MachineSetPool,
    md: &MachineDeployment,
    fenceposts: Fenceposts,
) -> ScalePlan {
    let plan = proportional_targets(pool, md, fenceposts);
    keep_old_sets_from_growing(plan, pool)
}

fn keep_old_sets_from_growing(mut plan: ScalePlan, pool: &MachineSetPool) -> ScalePlan {
    let mut withheld = 0;
    for ms in &pool.old {
        let target = plan.target(ms);
        if target > ms.spec.replicas {
            withheld += target - ms.spec.replicas;
            plan.set(ms, ms.spec.replicas);
        }
    }

    if withheld > 0 {
        if let Some(new) = pool.new.as_ref() {
            let target = plan.target(new).saturating_add(withheld);
            plan.set(new, target);
        }
    }
    plan
}

fn proportional_targets(
    pool: &MachineSetPool,
    md: &MachineDeployment,
    fenceposts: Fenceposts,
) -> ScalePlan {
    let mut plan = ScalePlan::default();
    let desired = md.spec.replicas;

    if pool.new.is_none() && pool.old.is_empty() {
        return plan;
    }

    if let Some(ms) = find_one_active_or_latest(pool.new.as_ref(), &pool.old) {
        plan.set(ms, desired);
        return plan;
    }

    if let Some(new) = pool.new.as_ref() {
        if is_saturated(md, new) {
            for ms in pool.old.iter().filter(|ms| ms.is_active()) {
                plan.set(ms, 0);
            }
            return plan;
        }
    }

    if md.spec.strategy.strategy_type != StrategyType::RollingUpdate {
        return plan;
    }

    let mut active: Vec<&MachineSet> = pool.all().filter(|ms| ms.is_active()).collect();
    let total: i32 = active.iter().map(|ms| ms.spec.replicas).sum();
    let allowed_size = if desired > 0 {
        desired.saturating_add(fenceposts.max_surge)
    } else {
        0
    };
    let to_add = allowed_size - total;

    match to_add.cmp(&0) {
        Ordering::Greater => active.sort_by(|a, b| by_size(a, b, true)),
        Ordering::Less => active.sort_by(|a, b| by_size(a, b, false)),
        Ordering::Equal => {}
    }

    let mut added = 0;
    let mut sizes: Vec<i32> = Vec::with_capacity(active.len());
    for ms in &active {
        let share = if to_add != 0 {
            proportion(ms, md, fenceposts.max_surge, to_add, added)
        } else {
            0
        };
        sizes.push(ms.spec.replicas + share);
        added += share;
    }

    if to_add != 0 {
        if let Some(first) = sizes.first_mut() {
            *first = (*first + to_add - added).max(0);
        }
    }

    for (ms, size) in active.iter().zip(sizes) {
        plan.set(ms, size);
    }

    plan
}

#[cfg(test)]
#[path = "scaling_test.rs"]
mod tests;
