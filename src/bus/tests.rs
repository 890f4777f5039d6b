//! Control Bus Tests

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::envelope::{
    ConnectRequest, DisconnectRequest, MetricUsage, MetricsEvent, ResultStatus, StatsEvent,
    StatusEvent, JSON_RPC_VERSION,
};
use super::{extract_id, handle_connect, handle_disconnect, result_status};
use crate::agent::Agent;
use crate::config::Config;

fn test_agent() -> Arc<Agent> {
    let mut conf = Config::default();
    conf.local_url = "tcp://127.0.0.1:1".to_string();
    conf.bridge.connect_timeout = 2;
    Arc::new(Agent::new(Arc::new(conf)))
}

// =============================================================================
// Envelope encoding
// =============================================================================

#[test]
fn test_decode_connect_request() {
    let sample = r#"{"id":"42","url":"ssl://dev.example.com","token":"123123123"}"#;
    let request: ConnectRequest = serde_json::from_str(sample).unwrap();
    assert_eq!(
        request,
        ConnectRequest {
            id: "42".to_string(),
            url: "ssl://dev.example.com".to_string(),
            token: "123123123".to_string(),
        }
    );
}

#[test]
fn test_decode_connect_request_defaults() {
    let request: ConnectRequest = serde_json::from_str(r#"{"url":"ssl://h"}"#).unwrap();
    assert_eq!(request.id, "");
    assert_eq!(request.token, "");
}

#[test]
fn test_decode_connect_request_requires_url() {
    assert!(serde_json::from_str::<ConnectRequest>(r#"{"id":"1"}"#).is_err());
}

#[test]
fn test_decode_disconnect_request() {
    let request: DisconnectRequest = serde_json::from_str(r#"{"id":"7"}"#).unwrap();
    assert_eq!(request.id, "7");
}

#[test]
fn test_result_status_wire_names() {
    let result = ResultStatus {
        id: "42".to_string(),
        connected: true,
        configured: true,
        last_error: "boom".to_string(),
    };
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({
            "id": "42",
            "connected": true,
            "configured": true,
            "lastError": "boom",
        })
    );
}

#[test]
fn test_status_event_encoding() {
    let event = StatusEvent {
        status: "started".to_string(),
    };
    assert_eq!(
        serde_json::to_string(&event).unwrap(),
        r#"{"status":"started"}"#
    );
}

#[test]
fn test_stats_event_wire_names() {
    let event = StatsEvent {
        alloc: 1,
        heap_alloc: 2,
        total_alloc: 3,
        last_error: "".to_string(),
        connected: false,
        configured: true,
        timestamp: 1_400_000_000,
        ingress_counter: 4,
        egress_counter: 5,
        ingress_bytes: 6,
        egress_bytes: 7,
    };
    let value = serde_json::to_value(&event).unwrap();
    let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    for key in [
        "alloc",
        "heapAlloc",
        "totalAlloc",
        "lastError",
        "connected",
        "configured",
        "timestamp",
        "ingressCounter",
        "egressCounter",
        "ingressBytes",
        "egressBytes",
    ] {
        assert!(keys.contains(&key), "missing wire field {}", key);
    }
}

#[test]
fn test_metrics_event_params_shape() {
    let event = MetricsEvent {
        jsonrpc: JSON_RPC_VERSION.to_string(),
        time: 1_400_000_000_000,
        params: (
            "meshbridge".to_string(),
            MetricUsage {
                memory: 1024,
                cpu: 1.5,
            },
        ),
    };
    assert_eq!(
        serde_json::to_value(&event).unwrap(),
        json!({
            "jsonrpc": "2.0",
            "time": 1_400_000_000_000_i64,
            "params": ["meshbridge", {"memory": 1024, "cpu": 1.5}],
        })
    );
}

// =============================================================================
// Control handling
// =============================================================================

#[test]
fn test_extract_id() {
    assert_eq!(extract_id(br#"{"id":"abc","bogus"#), "");
    assert_eq!(extract_id(br#"{"id":"abc","url":42}"#), "abc");
    assert_eq!(extract_id(br#"{"url":"ssl://h"}"#), "");
    assert_eq!(extract_id(b"not-json"), "");
}

#[test]
fn test_result_status_prefers_operation_error() {
    let agent = test_agent();
    let result = result_status(&agent, "1".to_string(), Some("boom".to_string()));
    assert_eq!(result.id, "1");
    assert_eq!(result.last_error, "boom");
    assert!(!result.configured);
    assert!(!result.connected);
}

#[test]
fn test_result_status_without_errors_is_empty() {
    let agent = test_agent();
    let result = result_status(&agent, "1".to_string(), None);
    assert_eq!(result.last_error, "");
}

#[tokio::test]
async fn test_handle_disconnect_unconfigured_reports_error() {
    let agent = test_agent();
    let result = handle_disconnect(&agent, br#"{"id":"9"}"#).await;
    assert_eq!(result.id, "9");
    assert!(!result.configured);
    assert_eq!(result.last_error, "already unconfigured");
}

#[tokio::test]
async fn test_handle_connect_undecodable_still_responds() {
    let agent = test_agent();
    let result = handle_connect(&agent, br#"{"id":"3","url":7}"#).await;
    assert_eq!(result.id, "3");
    assert!(result.last_error.contains("unable to decode connect request"));
    assert!(!result.configured);
}

#[tokio::test]
async fn test_handle_connect_failure_keeps_bridge_configured() {
    let agent = test_agent();
    let result = handle_connect(
        &agent,
        br#"{"id":"4","url":"tcp://127.0.0.1:1","token":"tok"}"#,
    )
    .await;
    assert_eq!(result.id, "4");
    assert!(result.configured);
    assert!(!result.connected);
    assert!(!result.last_error.is_empty());

    let result = handle_disconnect(&agent, br#"{"id":"5"}"#).await;
    assert_eq!(result.id, "5");
    assert!(!result.configured);
}

#[test]
fn test_decode_encode_roundtrip() {
    let value: Value =
        serde_json::from_str(r#"{"id":"1","connected":false,"configured":false,"lastError":""}"#)
            .unwrap();
    let decoded: ResultStatus = serde_json::from_value(value.clone()).unwrap();
    assert_eq!(serde_json::to_value(&decoded).unwrap(), value);
}
