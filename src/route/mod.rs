//! Message routing between the two brokers
//!
//! A [`Route`] is a single directional binding: one subscription filter on a
//! source broker, a rewrite rule, and a publish on the destination broker.
//! Routes run in one of two modes:
//!
//! - **Immediate** (the default): each received message is rewritten, tagged
//!   and published right away.
//! - **Batched**: received payloads accumulate in memory and a periodic tick
//!   flushes them as a single `{"batch":[...]}` envelope. Used for
//!   high-volume topics where per-message publishes would swamp the uplink.
//!
//! Publish failures are logged and counted but never halt a route; forwarded
//! traffic is QoS 0 fire-and-forget.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::tagging;
use crate::topic::ReplaceTopic;

#[cfg(test)]
mod tests;

/// Which broker a route reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reads from the local broker, publishes to the cloud.
    Local,
    /// Reads from the cloud broker, publishes locally.
    Cloud,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Local => write!(f, "local"),
            Direction::Cloud => write!(f, "cloud"),
        }
    }
}

/// Error returned by a destination publish.
#[derive(Debug)]
pub struct PublishError(pub String);

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PublishError {}

/// Destination seam for a route's outbound publishes.
///
/// Implemented for the MQTT client; tests substitute an in-memory capture.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Publish a payload at QoS 0, not retained.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;
}

/// Delivery mode for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Publish each message as it arrives.
    Immediate,
    /// Accumulate payloads and flush on the given interval.
    Batched(Duration),
}

/// Forwarding counters shared across reconnects.
///
/// Monotonic; read without locking by the status publisher. Values may
/// momentarily trail the handlers that increment them.
#[derive(Debug, Default)]
pub struct Counters {
    messages: AtomicU64,
    bytes: AtomicU64,
    publish_failures: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, payload_len: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }
}

/// One directional subscription/rewrite/publish binding.
pub struct Route {
    rule: &'static ReplaceTopic,
    direction: Direction,
    source: String,
    destination: Arc<dyn Destination>,
    mode: RouteMode,
    counters: Arc<Counters>,
    /// Pending (rewritten topic, raw payload) pairs, batched mode only.
    /// Emptied only by a successful flush or by `stop`.
    pending: Mutex<Vec<(String, Bytes)>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Route {
    pub fn new(
        rule: &'static ReplaceTopic,
        direction: Direction,
        source: String,
        destination: Arc<dyn Destination>,
        mode: RouteMode,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rule,
            direction,
            source,
            destination,
            mode,
            counters,
            pending: Mutex::new(Vec::new()),
            flusher: Mutex::new(None),
        })
    }

    /// Subscription filter this route listens on.
    pub fn filter(&self) -> &'static str {
        self.rule.filter
    }

    /// Check whether a received topic belongs to this route.
    pub fn matches(&self, topic: &str) -> bool {
        self.rule.matches(topic)
    }

    /// Start the periodic flusher for a batched route. No-op in immediate
    /// mode.
    pub fn start(self: &Arc<Self>) {
        let RouteMode::Batched(interval) = self.mode else {
            return;
        };

        let route = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                route.flush().await;
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    /// Stop the route, flushing any pending batch first.
    pub async fn stop(&self) {
        self.flush().await;
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
    }

    /// Handle one message received on the source broker.
    pub async fn handle(&self, topic: &str, payload: Bytes) {
        debug!(
            "({}) topic: {} updated: {} len: {}",
            self.direction,
            topic,
            self.rule.updated(topic),
            payload.len()
        );
        self.counters.record(payload.len());

        match self.mode {
            RouteMode::Immediate => {
                let outbound = self.rule.updated(topic);
                let tagged = tagging::tag(&payload, &self.source);
                if let Err(e) = self.destination.publish(&outbound, tagged).await {
                    self.counters.record_failure();
                    warn!("({}) publish to {} failed: {}", self.direction, outbound, e);
                }
            }
            RouteMode::Batched(_) => {
                let outbound = self.rule.updated(topic);
                self.pending.lock().push((outbound, payload));
            }
        }
    }

    /// Flush the pending batch, one envelope per distinct outbound topic.
    ///
    /// Payloads keep their delivery order inside each envelope. A failed
    /// publish puts its payloads back at the front of the queue for the next
    /// tick.
    pub async fn flush(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return;
        }

        let mut groups: Vec<(String, Vec<Bytes>)> = Vec::new();
        for (topic, payload) in drained {
            match groups.iter_mut().find(|(t, _)| *t == topic) {
                Some((_, payloads)) => payloads.push(payload),
                None => groups.push((topic, vec![payload])),
            }
        }

        let mut requeue: Vec<(String, Bytes)> = Vec::new();
        for (topic, payloads) in groups {
            let body = batch_envelope(&payloads);
            let tagged = tagging::tag(&body, &self.source);
            debug!(
                "({}) flushing {} payloads to {}",
                self.direction,
                payloads.len(),
                topic
            );
            if let Err(e) = self.destination.publish(&topic, tagged).await {
                self.counters.record_failure();
                warn!("({}) batch publish to {} failed: {}", self.direction, topic, e);
                requeue.extend(payloads.into_iter().map(|p| (topic.clone(), p)));
            }
        }

        if !requeue.is_empty() {
            let mut pending = self.pending.lock();
            requeue.extend(pending.drain(..));
            *pending = requeue;
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Join raw payloads into a `{"batch":[...]}` envelope.
fn batch_envelope(payloads: &[Bytes]) -> Vec<u8> {
    let joined: usize = payloads.iter().map(|p| p.len() + 1).sum();
    let mut body = Vec::with_capacity(joined + 12);
    body.extend_from_slice(b"{\"batch\":[");
    for (i, payload) in payloads.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(payload);
    }
    body.extend_from_slice(b"]}");
    body
}
