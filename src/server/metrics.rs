//! Prometheus metrics for the MachineDeployment controller
//!
//! - `fleet_reconciliations_total{strategy, outcome}` - reconcile passes by result
//! - `fleet_reconcile_duration_seconds{strategy}` - time spent per pass
//! - `fleet_in_place_upgrade_pending{namespace, machinedeployment}` - 1 while an
//!   in-place upgrade is outstanding

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Outcome label for a pass that finished its work
pub const OUTCOME_SUCCESS: &str = "success";

/// Outcome label for a pass that returned an error
pub const OUTCOME_ERROR: &str = "error";

/// Outcome label for a pass waiting on an external in-place upgrade
pub const OUTCOME_INCOMPLETE: &str = "incomplete";

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    reconcile_duration_seconds: HistogramVec,
    in_place_upgrade_pending: IntGaugeVec,
}

pub type SharedMetrics = Arc<ControllerMetrics>;

impl ControllerMetrics {
    /// Create and register all controller metrics in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "fleet_reconciliations_total",
                "MachineDeployment reconcile passes",
            ),
            &["strategy", "outcome"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fleet_reconcile_duration_seconds",
                "Duration of MachineDeployment reconcile passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["strategy"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let in_place_upgrade_pending = IntGaugeVec::new(
            Opts::new(
                "fleet_in_place_upgrade_pending",
                "1 while a MachineDeployment waits for an in-place upgrade",
            ),
            &["namespace", "machinedeployment"],
        )?;
        registry.register(Box::new(in_place_upgrade_pending.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            in_place_upgrade_pending,
        })
    }

    fn record(&self, strategy: &str, outcome: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[strategy, outcome])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_success(&self, strategy: &str, duration_secs: f64) {
        self.record(strategy, OUTCOME_SUCCESS, duration_secs);
    }

    pub fn record_reconciliation_error(&self, strategy: &str, duration_secs: f64) {
        self.record(strategy, OUTCOME_ERROR, duration_secs);
    }

    pub fn record_rollout_incomplete(&self, strategy: &str, duration_secs: f64) {
        self.record(strategy, OUTCOME_INCOMPLETE, duration_secs);
    }

    pub fn set_in_place_pending(&self, namespace: &str, name: &str, pending: bool) {
        self.in_place_upgrade_pending
            .with_label_values(&[namespace, name])
            .set(i64::from(pending));
    }

    /// Drop the per-deployment series of a MachineDeployment that is going away
    pub fn forget_deployment(&self, namespace: &str, name: &str) {
        // absent series are not an error here
        let _ = self
            .in_place_upgrade_pending
            .remove_label_values(&[namespace, name]);
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the shared metrics handle used by the controller and the HTTP server
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliation_counters_by_outcome() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconciliation_success("RollingUpdate", 0.2);
        metrics.record_reconciliation_success("RollingUpdate", 0.1);
        metrics.record_rollout_incomplete("InPlace", 0.05);
        metrics.record_reconciliation_error("InPlace", 0.0);

        let body = metrics.encode().unwrap();
        assert!(body.contains(
            r#"fleet_reconciliations_total{outcome="success",strategy="RollingUpdate"} 2"#
        ));
        assert!(body.contains(
            r#"fleet_reconciliations_total{outcome="incomplete",strategy="InPlace"} 1"#
        ));
        assert!(body.contains(r#"fleet_reconciliations_total{outcome="error",strategy="InPlace"} 1"#));
        assert!(body.contains("fleet_reconcile_duration_seconds_bucket"));
    }

    #[test]
    fn test_in_place_pending_gauge() {
        let metrics = create_metrics().unwrap();
        metrics.set_in_place_pending("default", "workers", true);
        let body = metrics.encode().unwrap();
        assert!(body.contains(
            r#"fleet_in_place_upgrade_pending{machinedeployment="workers",namespace="default"} 1"#
        ));

        metrics.set_in_place_pending("default", "workers", false);
        let body = metrics.encode().unwrap();
        assert!(body.contains(
            r#"fleet_in_place_upgrade_pending{machinedeployment="workers",namespace="default"} 0"#
        ));
    }

    #[test]
    fn test_forget_deployment_drops_series() {
        let metrics = create_metrics().unwrap();
        metrics.set_in_place_pending("default", "workers", true);
        metrics.set_in_place_pending("default", "infra", false);

        metrics.forget_deployment("default", "workers");
        // forgetting twice is harmless
        metrics.forget_deployment("default", "workers");

        let body = metrics.encode().unwrap();
        assert!(!body.contains(r#"machinedeployment="workers""#));
        assert!(body.contains(r#"machinedeployment="infra""#));
    }
}
