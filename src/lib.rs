//! meshbridge - MQTT bridge agent
//!
//! A long-running agent that bridges a local MQTT broker to a cloud broker:
//! messages are forwarded both ways under rewritten topic names, tagged with
//! a `$mesh_source` provenance field, and optionally coalesced into batched
//! envelopes. A control plane on the local broker (`$sphere/bridge/*`)
//! configures the cloud endpoint at runtime and publishes periodic status
//! and metrics events.

pub mod agent;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod metrics;
pub mod route;
pub mod tagging;
pub mod topic;

pub use agent::Agent;
pub use bridge::{Bridge, BridgeError, BrokerScheme, BrokerUrl};
pub use bus::{Bus, ConnectRequest, DisconnectRequest, ResultStatus, StatsEvent, StatusEvent};
pub use config::{BridgeTuning, Config, ConfigError};
pub use metrics::ProcessMonitor;
pub use route::{Destination, Direction, Route, RouteMode};
pub use topic::{ReplaceTopic, CLOUD_TOPICS, LOCAL_TOPICS};
