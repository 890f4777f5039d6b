//! Route Tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{Counters, Destination, Direction, PublishError, Route, RouteMode};
use crate::topic::ReplaceTopic;

/// Captures publishes instead of talking to a broker.
#[derive(Default)]
struct CaptureDestination {
    published: Mutex<Vec<(String, Bytes)>>,
    fail: AtomicBool,
}

impl CaptureDestination {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Destination for CaptureDestination {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(PublishError("capture destination set to fail".into()));
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

const RULE: ReplaceTopic = ReplaceTopic {
    filter: "$device/+/+/rssi",
    replace: "$device",
    with: "$cloud/device",
};

fn immediate_route(destination: Arc<CaptureDestination>) -> Arc<Route> {
    Route::new(
        &RULE,
        Direction::Local,
        "serial-123".to_string(),
        destination,
        RouteMode::Immediate,
        Counters::new(),
    )
}

fn batched_route(destination: Arc<CaptureDestination>) -> Arc<Route> {
    Route::new(
        &RULE,
        Direction::Local,
        "S".to_string(),
        destination,
        RouteMode::Batched(Duration::from_secs(1)),
        Counters::new(),
    )
}

fn parse(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn test_immediate_rewrites_and_tags() {
    let destination = CaptureDestination::new();
    let route = immediate_route(destination.clone());

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(br#"{"a":1}"#))
        .await;

    let published = destination.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "$cloud/device/AA/BB/rssi");
    assert_eq!(
        parse(&published[0].1),
        json!({"a": 1, "$mesh_source": "serial-123"})
    );
}

#[tokio::test]
async fn test_immediate_forwards_non_json_verbatim() {
    let destination = CaptureDestination::new();
    let route = immediate_route(destination.clone());

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(b"not-json"))
        .await;

    let published = destination.published();
    assert_eq!(published[0].1.as_ref(), b"not-json".as_slice());
}

#[tokio::test]
async fn test_immediate_counts_messages_and_bytes() {
    let destination = CaptureDestination::new();
    let counters = Counters::new();
    let route = Route::new(
        &RULE,
        Direction::Local,
        "s".to_string(),
        destination,
        RouteMode::Immediate,
        counters.clone(),
    );

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(b"12345"))
        .await;
    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(b"678"))
        .await;

    assert_eq!(counters.messages(), 2);
    assert_eq!(counters.bytes(), 8);
    assert_eq!(counters.publish_failures(), 0);
}

#[tokio::test]
async fn test_immediate_publish_failure_is_counted_not_fatal() {
    let destination = CaptureDestination::new();
    destination.fail.store(true, Ordering::Relaxed);
    let counters = Counters::new();
    let route = Route::new(
        &RULE,
        Direction::Local,
        "s".to_string(),
        destination.clone(),
        RouteMode::Immediate,
        counters.clone(),
    );

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(b"{}"))
        .await;

    assert_eq!(counters.publish_failures(), 1);
    assert_eq!(counters.messages(), 1);

    // route keeps working once the destination recovers
    destination.fail.store(false, Ordering::Relaxed);
    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(b"{}"))
        .await;
    assert_eq!(destination.published().len(), 1);
}

#[tokio::test]
async fn test_batched_flush_preserves_order() {
    let destination = CaptureDestination::new();
    let route = batched_route(destination.clone());

    for payload in [br#"{"a":1}"#, br#"{"a":2}"#, br#"{"a":3}"#] {
        route
            .handle("$device/AA/BB/rssi", Bytes::from_static(payload))
            .await;
    }
    assert!(destination.published().is_empty());

    route.flush().await;

    let published = destination.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "$cloud/device/AA/BB/rssi");
    assert_eq!(
        parse(&published[0].1),
        json!({
            "$mesh_source": "S",
            "batch": [{"a": 1}, {"a": 2}, {"a": 3}],
        })
    );
    assert_eq!(route.pending_len(), 0);
}

#[tokio::test]
async fn test_batched_flush_groups_by_outbound_topic() {
    let destination = CaptureDestination::new();
    let route = batched_route(destination.clone());

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(br#"{"n":1}"#))
        .await;
    route
        .handle("$device/CC/DD/rssi", Bytes::from_static(br#"{"n":2}"#))
        .await;
    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(br#"{"n":3}"#))
        .await;

    route.flush().await;

    let published = destination.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].0, "$cloud/device/AA/BB/rssi");
    assert_eq!(
        parse(&published[0].1),
        json!({"$mesh_source": "S", "batch": [{"n": 1}, {"n": 3}]})
    );
    assert_eq!(published[1].0, "$cloud/device/CC/DD/rssi");
}

#[tokio::test]
async fn test_empty_flush_publishes_nothing() {
    let destination = CaptureDestination::new();
    let route = batched_route(destination.clone());

    route.flush().await;

    assert!(destination.published().is_empty());
}

#[tokio::test]
async fn test_failed_flush_requeues_payloads() {
    let destination = CaptureDestination::new();
    destination.fail.store(true, Ordering::Relaxed);
    let route = batched_route(destination.clone());

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(br#"{"a":1}"#))
        .await;
    route.flush().await;

    assert!(destination.published().is_empty());
    assert_eq!(route.pending_len(), 1);

    destination.fail.store(false, Ordering::Relaxed);
    route.flush().await;

    let published = destination.published();
    assert_eq!(published.len(), 1);
    assert_eq!(route.pending_len(), 0);
}

#[tokio::test]
async fn test_stop_flushes_pending_batch() {
    let destination = CaptureDestination::new();
    let route = batched_route(destination.clone());
    route.start();

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(br#"{"a":1}"#))
        .await;
    route.stop().await;

    assert_eq!(destination.published().len(), 1);
    assert_eq!(route.pending_len(), 0);
}

#[tokio::test]
async fn test_periodic_flush_ticks() {
    let destination = CaptureDestination::new();
    let route = Route::new(
        &RULE,
        Direction::Local,
        "S".to_string(),
        destination.clone(),
        RouteMode::Batched(Duration::from_millis(10)),
        Counters::new(),
    );
    route.start();

    route
        .handle("$device/AA/BB/rssi", Bytes::from_static(br#"{"a":1}"#))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    route.stop().await;

    assert_eq!(destination.published().len(), 1);
}

#[tokio::test]
async fn test_immediate_start_spawns_no_flusher() {
    let destination = CaptureDestination::new();
    let route = immediate_route(destination);
    route.start();
    assert!(route.flusher.lock().is_none());
}
