//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

/// How long to wait for an expected event.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait before concluding that no event is coming.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(100);

/// Receive the next payload or fail the test.
pub async fn recv(rx: &mut UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(RECEIVE_TIMEOUT, rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Subscription channel closed")
}

/// Assert that nothing arrives within the silence window.
pub async fn assert_silent(rx: &mut UnboundedReceiver<Value>) {
    tokio::time::sleep(SILENCE_WINDOW).await;
    assert!(rx.try_recv().is_err(), "Received unexpected event");
}

/// Drain everything that arrived within the silence window.
pub async fn drain(rx: &mut UnboundedReceiver<Value>) -> Vec<Value> {
    tokio::time::sleep(SILENCE_WINDOW).await;
    let mut received = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        received.push(payload);
    }
    received
}
