//! Agent composition root
//!
//! Pulls together the configuration, the bridge and the process monitor,
//! and exposes the operations the control bus drives: start/stop the bridge
//! and snapshot status and metrics.

use std::sync::Arc;

use tracing::info;

use crate::bridge::{Bridge, BridgeError};
use crate::bus::{ConnectRequest, DisconnectRequest, MetricUsage, MetricsEvent, StatsEvent, JSON_RPC_VERSION};
use crate::config::Config;
use crate::metrics::{self, ProcessMonitor};

/// Module name reported in metrics events.
const MODULE_NAME: &str = env!("CARGO_PKG_NAME");

pub struct Agent {
    conf: Arc<Config>,
    bridge: Bridge,
    monitor: ProcessMonitor,
}

impl Agent {
    pub fn new(conf: Arc<Config>) -> Self {
        Self {
            bridge: Bridge::new(conf.clone()),
            monitor: ProcessMonitor::new(),
            conf,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Configure the bridge from a control request.
    pub async fn start_bridge(&self, request: &ConnectRequest) -> Result<(), BridgeError> {
        info!("starting bridge to {}", request.url);
        self.bridge.start(&request.url, &request.token).await
    }

    /// Unconfigure the bridge from a control request.
    pub async fn stop_bridge(&self, _request: &DisconnectRequest) -> Result<(), BridgeError> {
        info!("stopping bridge");
        self.bridge.stop().await
    }

    /// Snapshot the bridge state and forwarding counters.
    pub fn status(&self) -> StatsEvent {
        let usage = self.monitor.sample();
        let egress = self.bridge.egress();
        let ingress = self.bridge.ingress();

        StatsEvent {
            alloc: usage.memory,
            heap_alloc: usage.memory,
            total_alloc: usage.virtual_memory,
            last_error: self.bridge.last_error().unwrap_or_default(),
            connected: self.bridge.is_connected(),
            configured: self.bridge.is_configured(),
            timestamp: metrics::unix_time(),
            ingress_counter: ingress.messages() as i64,
            egress_counter: egress.messages() as i64,
            ingress_bytes: ingress.bytes() as i64,
            egress_bytes: egress.bytes() as i64,
        }
    }

    /// Sample process usage into a metrics event.
    pub fn metrics(&self) -> MetricsEvent {
        let usage = self.monitor.sample();
        MetricsEvent {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            time: metrics::unix_time_ms(),
            params: (
                MODULE_NAME.to_string(),
                MetricUsage {
                    memory: usage.memory,
                    cpu: usage.cpu,
                },
            ),
        }
    }

    /// Serial number this agent reports as.
    pub fn serial_no(&self) -> &str {
        &self.conf.serial_no
    }

    /// Stop the bridge if it is configured; used on process shutdown.
    pub async fn shutdown(&self) {
        if self.bridge.is_configured() {
            let _ = self.bridge.stop().await;
        }
    }
}
