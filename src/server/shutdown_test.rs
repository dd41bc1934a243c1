//! Tests for graceful shutdown handling

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_shutdown_propagates_to_clones() {
    let (controller, signal) = shutdown_channel();
    let clone = signal.clone();
    assert!(!signal.is_shutdown());

    controller.shutdown();
    // repeated triggers are harmless
    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(clone.is_shutdown());
}

#[tokio::test]
async fn test_wait_completes_on_shutdown() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(result.is_ok(), "wait() should complete when shutdown triggered");
}

#[tokio::test]
async fn test_wait_completes_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_wait_blocks_until_triggered() {
    let (_controller, mut signal) = shutdown_channel();

    let result = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
    assert!(result.is_err(), "wait() should not complete without a trigger");
}
