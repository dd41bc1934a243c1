use anyhow::Context as _;
use fleetroll::controller::clock::SystemClock;
use fleetroll::controller::deployment::requeue_after_error;
use fleetroll::controller::store::KubeStore;
use fleetroll::controller::{reconcile, Context, ReconcileError};
use fleetroll::crd::machine_deployment::MachineDeployment;
use fleetroll::crd::machine_set::MachineSet;
use fleetroll::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default port for health and metrics endpoints
const HEALTH_PORT: u16 = 8080;

/// Default requeue interval while an in-place upgrade is pending
const IN_PLACE_POLL_SECONDS: u64 = 15;

/// Controller settings read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// `FLEET_HEALTH_PORT`
    pub health_port: u16,
    /// `FLEET_WATCH_NAMESPACE`; unset or empty watches all namespaces
    pub watch_namespace: Option<String>,
    /// `FLEET_IN_PLACE_POLL_SECONDS`
    pub in_place_poll_interval: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let health_port = match lookup("FLEET_HEALTH_PORT") {
            Some(v) => v
                .parse::<u16>()
                .with_context(|| format!("invalid FLEET_HEALTH_PORT: {v}"))?,
            None => HEALTH_PORT,
        };

        let watch_namespace = lookup("FLEET_WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let poll_seconds = match lookup("FLEET_IN_PLACE_POLL_SECONDS") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .with_context(|| format!("invalid FLEET_IN_PLACE_POLL_SECONDS: {v}"))?,
            None => IN_PLACE_POLL_SECONDS,
        };

        Ok(Self {
            health_port,
            watch_namespace,
            in_place_poll_interval: Duration::from_secs(poll_seconds),
        })
    }
}

/// Error policy for the controller
///
/// Conflicts are retried after 2s, everything else after 10s. Metrics for
/// failed passes are recorded by `reconcile` itself.
///
/// Uses `warn!` since reconciliation errors are expected and trigger retries.
pub fn error_policy(
    md: Arc<MachineDeployment>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    let requeue = requeue_after_error(error);
    warn!(
        machinedeployment = ?md.name_any(),
        error = %error,
        requeue_secs = requeue.as_secs(),
        "Reconcile error (will retry)"
    );
    Action::requeue(requeue)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting fleet MachineDeployment controller");

    let config = ControllerConfig::from_env()?;
    info!(
        health_port = config.health_port,
        namespace = ?config.watch_namespace,
        in_place_poll_secs = config.in_place_poll_interval.as_secs(),
        "Configuration loaded"
    );

    let (shutdown_controller, mut shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = create_metrics().context("failed to create metrics registry")?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let signal_readiness = readiness.clone();
    let signal_handle = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => info!(signal = signal, "Initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to install signal handlers, shutting down"),
        }
        // stop receiving traffic before the controller winds down
        signal_readiness.set_not_ready();
        shutdown_controller.shutdown();
    });

    let (deployments, machine_sets): (Api<MachineDeployment>, Api<MachineSet>) =
        match &config.watch_namespace {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    let ctx = Arc::new(
        Context::new(
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(SystemClock),
            Some(metrics.clone()),
        )
        .with_in_place_poll_interval(config.in_place_poll_interval),
    );

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // error_policy already logs errors with warn!, so only successes are logged here
    let controller = Controller::new(deployments, watcher::Config::default())
        .owns(machine_sets, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled: {:?}", o);
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        _ = shutdown_signal.wait() => {
            info!("Stopping controller");
        }
    }

    signal_handle.abort();
    health_handle.abort();

    info!("Fleet controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
