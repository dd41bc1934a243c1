use super::scaling::Fenceposts;
use crate::controller::store::selector_matches;
use crate::crd::machine_deployment::MachineDeployment;

/// Validate MachineDeployment specification
///
/// Validates runtime constraints that cannot be enforced via CRD schema.
///
/// # Validation Rules
/// - `spec.replicas` must be >= 0
/// - `spec.revisionHistoryLimit` must be >= 0 when set
/// - `spec.clusterName` must be set and equal `spec.template.spec.clusterName`
/// - `spec.selector` must be non-empty and select the template labels
/// - `maxSurge` / `maxUnavailable` must be a non-negative integer or a 0-100 percentage
/// - `spec.replicas + maxSurge` must fit in an i32
///
/// # Returns
/// * `Ok(())` - Validation passed
/// * `Err(String)` - Validation error message
pub fn validate_machine_deployment(md: &MachineDeployment) -> Result<(), String> {
    if md.spec.replicas < 0 {
        return Err(format!(
            "spec.replicas must be >= 0, got {}",
            md.spec.replicas
        ));
    }

    if let Some(limit) = md.spec.revision_history_limit {
        if limit < 0 {
            return Err(format!(
                "spec.revisionHistoryLimit must be >= 0, got {limit}"
            ));
        }
    }

    if md.spec.cluster_name.is_empty() {
        return Err("spec.clusterName cannot be empty".to_string());
    }

    if md.spec.template.spec.cluster_name != md.spec.cluster_name {
        return Err(format!(
            "spec.template.spec.clusterName must be {}, got {}",
            md.spec.cluster_name, md.spec.template.spec.cluster_name
        ));
    }

    let selector = &md.spec.selector;
    let selector_empty = selector
        .match_labels
        .as_ref()
        .map(|l| l.is_empty())
        .unwrap_or(true)
        && selector
            .match_expressions
            .as_ref()
            .map(|e| e.is_empty())
            .unwrap_or(true);
    if selector_empty {
        return Err("spec.selector cannot be empty".to_string());
    }

    if !selector_matches(selector, &md.spec.template.labels()) {
        return Err("spec.selector does not match spec.template.metadata.labels".to_string());
    }

    if let Some(rolling) = &md.spec.strategy.rolling_update {
        if let Some(surge) = &rolling.max_surge {
            if !is_valid_budget_format(surge) {
                return Err(format!(
                    "spec.strategy.rollingUpdate.maxSurge invalid: {surge}"
                ));
            }
        }
        if let Some(unavailable) = &rolling.max_unavailable {
            if !is_valid_budget_format(unavailable) {
                return Err(format!(
                    "spec.strategy.rollingUpdate.maxUnavailable invalid: {unavailable}"
                ));
            }
        }
    }

    if let Err(e) = Fenceposts::for_deployment(md) {
        return Err(format!("spec.replicas too large: {e}"));
    }

    Ok(())
}

/// Validate maxSurge/maxUnavailable value format
///
/// Returns true if the value is a valid format:
/// - Percentage: "0%" to "100%" (non-negative)
/// - Absolute: non-negative integer
pub(crate) fn is_valid_budget_format(value: &str) -> bool {
    if let Some(percent_str) = value.strip_suffix('%') {
        match percent_str.parse::<i32>() {
            Ok(percent) => (0..=100).contains(&percent),
            Err(_) => false,
        }
    } else {
        match value.parse::<i32>() {
            Ok(abs) => abs >= 0,
            Err(_) => false,
        }
    }
}
