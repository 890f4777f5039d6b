//! Control-plane wire envelopes
//!
//! JSON envelopes exchanged on the `$sphere/bridge/*` topics. Field names
//! are part of the wire contract with the external controller and use
//! camelCase exactly as listed here.

use serde::{Deserialize, Serialize};

/// JSON-RPC version tag carried by [`MetricsEvent`].
pub const JSON_RPC_VERSION: &str = "2.0";

/// Request to configure the bridge against a cloud broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
}

/// Request to unconfigure the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    #[serde(default)]
    pub id: String,
}

/// Outcome of a control request, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultStatus {
    pub id: String,
    pub connected: bool,
    pub configured: bool,
    pub last_error: String,
}

/// One-shot lifecycle announcement, published when the bus comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: String,
}

/// Periodic bridge status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEvent {
    pub alloc: u64,
    pub heap_alloc: u64,
    pub total_alloc: u64,
    pub last_error: String,
    pub connected: bool,
    pub configured: bool,
    pub timestamp: i64,
    pub ingress_counter: i64,
    pub egress_counter: i64,
    pub ingress_bytes: i64,
    pub egress_bytes: i64,
}

/// Periodic process usage report in JSON-RPC notification shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub jsonrpc: String,
    pub time: i64,
    /// `[module name, usage]` pair, serialized as a two-element array.
    pub params: (String, MetricUsage),
}

/// Memory and CPU usage of the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricUsage {
    pub memory: u64,
    pub cpu: f64,
}
