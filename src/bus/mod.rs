//! Control Bus
//!
//! Manages all the data going into and out of this service: a third client
//! on the local broker listens for connect/disconnect requests, hands them
//! to the [`Agent`], and answers every request, decodable or not, with
//! exactly one [`ResultStatus`] on the response topic. Two tickers publish
//! the periodic status and metrics envelopes.
//!
//! Control requests are handled sequentially on a single task, so responses
//! are published in the order requests were received. Failing to reach the
//! local broker at startup is fatal: without the bus the agent cannot be
//! commanded at all.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::bridge::client::{self, BrokerUrl};
use crate::bridge::BridgeError;
use crate::config::Config;

mod envelope;

#[cfg(test)]
mod tests;

pub use envelope::{
    ConnectRequest, DisconnectRequest, MetricUsage, MetricsEvent, ResultStatus, StatsEvent,
    StatusEvent, JSON_RPC_VERSION,
};

/// Inbound control topic: configure the bridge.
pub const CONNECT_TOPIC: &str = "$sphere/bridge/connect";
/// Inbound control topic: unconfigure the bridge.
pub const DISCONNECT_TOPIC: &str = "$sphere/bridge/disconnect";
/// Outbound topic for lifecycle and periodic status events.
pub const STATUS_TOPIC: &str = "$sphere/bridge/status";
/// Outbound topic for control request outcomes.
pub const RESPONSE_TOPIC: &str = "$sphere/bridge/response";

/// Client id of the bus connection on the local broker.
pub const BUS_CLIENT_ID: &str = "meshbridge-bus";

/// Control request payload queued from the driver to the handler task.
enum ControlMessage {
    Connect(Bytes),
    Disconnect(Bytes),
}

/// The control bus, connected and listening.
pub struct Bus {
    client: AsyncClient,
    tasks: Vec<JoinHandle<()>>,
}

impl Bus {
    /// Connect to the local broker and start listening for control
    /// requests.
    ///
    /// Publishes the one-shot `started` status event, installs the control
    /// subscriptions and spawns the driver, control and ticker tasks.
    pub async fn listen(conf: Arc<Config>, agent: Arc<Agent>) -> Result<Bus, BridgeError> {
        info!("connecting to the bus at {}", conf.local_url);

        let url = BrokerUrl::parse(&conf.local_url)?;
        let (client, eventloop) =
            client::connect(&url, "", BUS_CLIENT_ID.to_string(), &conf.bridge).await?;

        publish_json(
            &client,
            STATUS_TOPIC,
            &StatusEvent {
                status: "started".to_string(),
            },
        )
        .await;
        subscribe_control(&client).await?;

        // bounded queue between the event loop and the sequential handler
        let (control_tx, control_rx) = mpsc::channel(16);

        let tasks = vec![
            tokio::spawn(drive(client.clone(), eventloop, control_tx)),
            tokio::spawn(handle_control(client.clone(), agent.clone(), control_rx)),
            tokio::spawn(publish_status(
                client.clone(),
                agent.clone(),
                Duration::from_secs(conf.status_interval),
            )),
            tokio::spawn(publish_metrics(
                client.clone(),
                agent,
                format!("$node/{}/module/status", conf.serial_no),
                Duration::from_secs(conf.metrics_interval),
            )),
        ];

        Ok(Bus { client, tasks })
    }

    /// Disconnect from the local broker and stop the bus tasks.
    pub async fn stop(self) {
        info!("stopping the bus");
        let _ = self.client.disconnect().await;
        // let the driver flush the disconnect before tearing it down
        tokio::time::sleep(Duration::from_millis(100)).await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Install the control-plane subscriptions.
async fn subscribe_control(client: &AsyncClient) -> Result<(), BridgeError> {
    for topic in [CONNECT_TOPIC, DISCONNECT_TOPIC] {
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Subscribe(format!("{}: {}", topic, e)))?;
        debug!("(bus) subscribed to {}", topic);
    }
    Ok(())
}

/// Drive the bus event loop, queueing control requests for the handler.
///
/// The underlying client reconnects on its own after an error; control
/// subscriptions are reinstalled on every CONNACK.
async fn drive(client: AsyncClient, mut eventloop: EventLoop, control_tx: mpsc::Sender<ControlMessage>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = match publish.topic.as_str() {
                    CONNECT_TOPIC => ControlMessage::Connect(publish.payload),
                    DISCONNECT_TOPIC => ControlMessage::Disconnect(publish.payload),
                    other => {
                        debug!("(bus) ignoring publish on {}", other);
                        continue;
                    }
                };
                if control_tx.send(message).await.is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Err(e) = subscribe_control(&client).await {
                    warn!("(bus) resubscribe failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("(bus) connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Handle queued control requests one at a time, answering each with a
/// [`ResultStatus`] on the response topic.
async fn handle_control(
    client: AsyncClient,
    agent: Arc<Agent>,
    mut control_rx: mpsc::Receiver<ControlMessage>,
) {
    while let Some(message) = control_rx.recv().await {
        let result = match message {
            ControlMessage::Connect(payload) => handle_connect(&agent, &payload).await,
            ControlMessage::Disconnect(payload) => handle_disconnect(&agent, &payload).await,
        };
        publish_json(&client, RESPONSE_TOPIC, &result).await;
    }
}

async fn handle_connect(agent: &Agent, payload: &[u8]) -> ResultStatus {
    info!("handle connect");
    let (id, error) = match serde_json::from_slice::<ConnectRequest>(payload) {
        Ok(request) => {
            let error = agent.start_bridge(&request).await.err();
            (request.id, error.map(|e| e.to_string()))
        }
        Err(e) => {
            warn!("unable to decode connect request: {}", e);
            (
                extract_id(payload),
                Some(format!("unable to decode connect request: {}", e)),
            )
        }
    };
    result_status(agent, id, error)
}

async fn handle_disconnect(agent: &Agent, payload: &[u8]) -> ResultStatus {
    info!("handle disconnect");
    let (id, error) = match serde_json::from_slice::<DisconnectRequest>(payload) {
        Ok(request) => {
            let error = agent.stop_bridge(&request).await.err();
            (request.id, error.map(|e| e.to_string()))
        }
        Err(e) => {
            warn!("unable to decode disconnect request: {}", e);
            (
                extract_id(payload),
                Some(format!("unable to decode disconnect request: {}", e)),
            )
        }
    };
    result_status(agent, id, error)
}

/// Build the response for a control request against the bridge's current
/// state. A request that produced no error of its own reports the bridge's
/// last connection error, if any.
fn result_status(agent: &Agent, id: String, error: Option<String>) -> ResultStatus {
    let bridge = agent.bridge();
    ResultStatus {
        id,
        connected: bridge.is_connected(),
        configured: bridge.is_configured(),
        last_error: error.or_else(|| bridge.last_error()).unwrap_or_default(),
    }
}

/// Best-effort `id` recovery from a payload that failed to decode, so the
/// controller can still correlate the response.
fn extract_id(payload: &[u8]) -> String {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

/// Publish the periodic status envelope.
async fn publish_status(client: AsyncClient, agent: Arc<Agent>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.reset();
    loop {
        ticker.tick().await;
        let status = agent.status();
        debug!("status {:?}", status);
        publish_json(&client, STATUS_TOPIC, &status).await;
    }
}

/// Publish the periodic metrics envelope.
async fn publish_metrics(client: AsyncClient, agent: Arc<Agent>, topic: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.reset();
    loop {
        ticker.tick().await;
        publish_json(&client, &topic, &agent.metrics()).await;
    }
}

/// Encode a value and publish it at QoS 0. Failures are logged, never
/// propagated.
async fn publish_json<T: Serialize>(client: &AsyncClient, topic: &str, value: &T) {
    let payload = match serde_json::to_vec(value) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("encoding for {} failed: {}", topic, e);
            return;
        }
    };
    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
        warn!("publish to {} failed: {}", topic, e);
    }
}
