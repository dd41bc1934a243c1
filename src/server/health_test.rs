//! Tests for health and metrics endpoints

use super::*;
use std::time::Duration;

/// Wait for server to accept connections, backing off between attempts
async fn wait_for_server(port: u16, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://127.0.0.1:{port}/healthz"))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {max_retries} attempts: {e}"),
        }
    }
    client
}

fn spawn_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    tokio::spawn(async move { run_health_server(port, readiness, metrics).await })
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().expect("metrics registry");
    let port = 18180;

    let handle = spawn_server(port, readiness, metrics);
    let client = wait_for_server(port, 10).await;

    let response = client
        .get(format!("http://127.0.0.1:{port}/healthz"))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server");

    assert_eq!(response.status(), 200, "Liveness probe should return 200");

    handle.abort();
}

#[tokio::test]
async fn test_readyz_follows_readiness_state() {
    let readiness = ReadinessState::new();
    assert!(!readiness.is_ready(), "Should start as not ready");
    let metrics = create_metrics().expect("metrics registry");
    let port = 18181;

    let handle = spawn_server(port, readiness.clone(), metrics);
    let client = wait_for_server(port, 10).await;
    let url = format!("http://127.0.0.1:{port}/readyz");

    let response = client.get(&url).send().await.expect("readyz request");
    assert_eq!(response.status(), 503);

    readiness.set_ready();
    let response = client.get(&url).send().await.expect("readyz request");
    assert_eq!(response.status(), 200);

    // shutdown flips readiness back
    readiness.set_not_ready();
    let response = client.get(&url).send().await.expect("readyz request");
    assert_eq!(response.status(), 503);

    handle.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_controller_metrics() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().expect("metrics registry");
    metrics.record_reconciliation_success("RollingUpdate", 0.05);
    let port = 18182;

    let handle = spawn_server(port, readiness, metrics);
    let client = wait_for_server(port, 10).await;

    let response = client
        .get(format!("http://127.0.0.1:{port}/metrics"))
        .send()
        .await
        .expect("metrics request");

    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = response.text().await.expect("metrics body");
    assert!(body.contains("fleet_reconciliations_total"));

    handle.abort();
}
