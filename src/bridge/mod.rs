//! MQTT Bridge
//!
//! Acts as a bridge between the local and cloud brokers, including
//! reconnecting and status reporting.
//!
//! Once started the bridge connects a client to each broker, installs the
//! whitelist subscriptions, and forwards messages both ways through
//! [`Route`]s. If either link dies the bridge tears both clients down and
//! rebuilds them after a backoff chosen by failure reason: credential
//! rejections wait longer than transient network errors.
//!
//! # Lifecycle
//!
//! The bridge is unconfigured until `start(url, token)` succeeds or at least
//! parses its URL; from then on a supervision task owns reconnection until
//! `stop()`. Re-entrant calls return [`BridgeError::AlreadyConfigured`] /
//! [`BridgeError::AlreadyUnconfigured`] without touching state. At most one
//! reconnect timer is armed at any time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::route::{Counters, Direction, Route, RouteMode};
use crate::tagging;
use crate::topic::{CLOUD_TOPICS, LOCAL_TOPICS};

pub(crate) mod client;


pub use client::{BrokerScheme, BrokerUrl};

/// Errors surfaced by bridge operations.
#[derive(Debug)]
pub enum BridgeError {
    /// `start` called while the bridge is configured.
    AlreadyConfigured,
    /// `stop` called while the bridge is unconfigured.
    AlreadyUnconfigured,
    /// Broker URL could not be parsed.
    InvalidUrl(String),
    /// Broker rejected the credentials.
    BadCredentials(String),
    /// Connection could not be established or was lost.
    Connect(String),
    /// Subscription installation failed.
    Subscribe(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::AlreadyConfigured => write!(f, "already configured"),
            BridgeError::AlreadyUnconfigured => write!(f, "already unconfigured"),
            BridgeError::InvalidUrl(msg) => write!(f, "invalid broker url: {}", msg),
            BridgeError::BadCredentials(msg) => write!(f, "bad credentials: {}", msg),
            BridgeError::Connect(msg) => write!(f, "connect failed: {}", msg),
            BridgeError::Subscribe(msg) => write!(f, "subscribe failed: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Lock-free bridge state read by the control bus.
///
/// Advisory snapshot values, not authoritative: readers may momentarily see
/// a counter or flag trail the task that last wrote it.
struct BridgeStats {
    configured: AtomicBool,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    /// local-to-cloud traffic
    egress: Arc<Counters>,
    /// cloud-to-local traffic
    ingress: Arc<Counters>,
}

impl BridgeStats {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            configured: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            egress: Counters::new(),
            ingress: Counters::new(),
        })
    }

    fn record_error(&self, reason: &BridgeError) {
        *self.last_error.lock() = Some(reason.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.lock() = None;
    }
}

/// Handle to a configured bridge episode.
struct Configured {
    link: Arc<Link>,
    shutdown_tx: mpsc::Sender<()>,
    supervisor: JoinHandle<()>,
}

/// The active local/cloud client pair.
struct Conn {
    local: AsyncClient,
    remote: AsyncClient,
    routes: Vec<Arc<Route>>,
    drivers: Vec<JoinHandle<()>>,
}

/// Bridge between the local and cloud brokers.
pub struct Bridge {
    conf: Arc<Config>,
    stats: Arc<BridgeStats>,
    /// Serializes start/stop; `Some` iff the bridge is configured.
    inner: tokio::sync::Mutex<Option<Configured>>,
}

impl Bridge {
    pub fn new(conf: Arc<Config>) -> Self {
        Self {
            conf,
            stats: BridgeStats::new(),
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Configure the bridge and connect to the cloud broker.
    ///
    /// A connect failure still leaves the bridge configured with a reconnect
    /// timer armed; the error is returned so the caller can report it.
    pub async fn start(&self, cloud_url: &str, token: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            warn!("already configured");
            return Err(BridgeError::AlreadyConfigured);
        }

        let url = BrokerUrl::parse(cloud_url)?;
        info!("connecting the bridge to {}", url);

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let link = Arc::new(Link {
            conf: self.conf.clone(),
            cloud_url: url,
            token: token.to_string(),
            stats: self.stats.clone(),
            reconnect_tx,
            timer: Mutex::new(None),
            conn: tokio::sync::Mutex::new(None),
            tearing_down: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        self.stats.configured.store(true, Ordering::SeqCst);

        let result = link.connect().await;
        if let Err(ref e) = result {
            error!("connect failed: {}", e);
            link.schedule_reconnect(e);
        }

        let supervisor = tokio::spawn(Link::supervise(link.clone(), reconnect_rx, shutdown_rx));
        *inner = Some(Configured {
            link,
            shutdown_tx,
            supervisor,
        });

        result
    }

    /// Unconfigure the bridge, disconnecting both clients.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let Some(configured) = inner.take() else {
            warn!("already unconfigured");
            return Err(BridgeError::AlreadyUnconfigured);
        };

        info!("disconnecting bridge");
        configured.link.shutdown.store(true, Ordering::SeqCst);
        let _ = configured.shutdown_tx.try_send(());
        configured.link.cancel_timer();
        configured.link.disconnect_all().await;
        self.stats.configured.store(false, Ordering::SeqCst);
        configured.supervisor.abort();

        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.stats.configured.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.stats.last_error.lock().clone()
    }

    /// Counters for local-to-cloud traffic.
    pub fn egress(&self) -> Arc<Counters> {
        self.stats.egress.clone()
    }

    /// Counters for cloud-to-local traffic.
    pub fn ingress(&self) -> Arc<Counters> {
        self.stats.ingress.clone()
    }
}

/// State shared between the bridge facade, the supervision task and the
/// client driver tasks for one configured episode.
struct Link {
    conf: Arc<Config>,
    cloud_url: BrokerUrl,
    token: String,
    stats: Arc<BridgeStats>,
    reconnect_tx: mpsc::Sender<()>,
    /// The armed reconnect timer, at most one.
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Active clients; mutated only under start/stop or by the supervisor.
    conn: tokio::sync::Mutex<Option<Conn>>,
    /// Set while clients are deliberately being torn down, so their driver
    /// errors do not schedule another reconnect.
    tearing_down: AtomicBool,
    shutdown: AtomicBool,
}

impl Link {
    /// Supervision loop: rebuild the clients on reconnect signals until
    /// shutdown.
    async fn supervise(
        link: Arc<Link>,
        mut reconnect_rx: mpsc::Receiver<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("bridge loop shutting down");
                    return;
                }
                Some(()) = reconnect_rx.recv() => {
                    if link.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    info!("reconnecting");
                    link.disconnect_all().await;
                    if let Err(e) = link.connect().await {
                        error!("reconnect failed: {}", e);
                        link.schedule_reconnect(&e);
                    }
                }
            }
        }
    }

    /// Build both clients, install the whitelist subscriptions and spawn the
    /// event-loop drivers. On success the bridge is connected and the last
    /// error is cleared.
    async fn connect(self: &Arc<Self>) -> Result<(), BridgeError> {
        let local_url = BrokerUrl::parse(&self.conf.local_url)?;
        let tuning = &self.conf.bridge;

        let (local, local_loop) = client::connect(
            &local_url,
            "",
            client::timestamped_id("meshbridge-local"),
            tuning,
        )
        .await?;

        let (remote, remote_loop) = match client::connect(
            &self.cloud_url,
            &self.token,
            client::timestamped_id("meshbridge-cloud"),
            tuning,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                let _ = local.disconnect().await;
                return Err(e);
            }
        };

        let cloud_source = tagging::cloud_source(self.cloud_url.host());
        let local_routes: Vec<Arc<Route>> = LOCAL_TOPICS
            .iter()
            .map(|rule| {
                Route::new(
                    rule,
                    Direction::Local,
                    self.conf.serial_no.clone(),
                    Arc::new(remote.clone()),
                    self.mode_for(rule.filter),
                    self.stats.egress.clone(),
                )
            })
            .collect();
        let cloud_routes: Vec<Arc<Route>> = CLOUD_TOPICS
            .iter()
            .map(|rule| {
                Route::new(
                    rule,
                    Direction::Cloud,
                    cloud_source.clone(),
                    Arc::new(local.clone()),
                    self.mode_for(rule.filter),
                    self.stats.ingress.clone(),
                )
            })
            .collect();

        if let Err(e) = install_subscriptions(&local, &remote, &local_routes, &cloud_routes).await {
            let _ = local.disconnect().await;
            let _ = remote.disconnect().await;
            return Err(e);
        }

        for route in local_routes.iter().chain(cloud_routes.iter()) {
            route.start();
        }

        let drivers = vec![
            tokio::spawn(Self::drive(
                self.clone(),
                local_loop,
                local_routes.clone(),
                Direction::Local,
            )),
            tokio::spawn(Self::drive(
                self.clone(),
                remote_loop,
                cloud_routes.clone(),
                Direction::Cloud,
            )),
        ];

        let mut routes = local_routes;
        routes.extend(cloud_routes);

        let mut conn_slot = self.conn.lock().await;
        if self.shutdown.load(Ordering::SeqCst) {
            // stopped while we were connecting; tear the new clients down
            let _ = local.disconnect().await;
            let _ = remote.disconnect().await;
            for driver in drivers {
                driver.abort();
            }
            return Ok(());
        }
        *conn_slot = Some(Conn {
            local,
            remote,
            routes,
            drivers,
        });
        drop(conn_slot);

        self.stats.connected.store(true, Ordering::SeqCst);
        self.stats.clear_error();
        info!("bridge connected to {}", self.cloud_url);

        Ok(())
    }

    /// Drive one client's event loop, dispatching publishes to its routes.
    ///
    /// Ends on the first poll error; the supervision task rebuilds clients
    /// rather than resuming a dead loop.
    async fn drive(
        link: Arc<Link>,
        mut eventloop: EventLoop,
        routes: Vec<Arc<Route>>,
        direction: Direction,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match routes.iter().find(|r| r.matches(&publish.topic)) {
                        Some(route) => route.handle(&publish.topic, publish.payload).await,
                        None => debug!("({}) no route for {}", direction, publish.topic),
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("({}) subscription acknowledged", direction);
                }
                Ok(_) => {}
                Err(e) => {
                    if link.suppressed() {
                        debug!("({}) client closed", direction);
                    } else {
                        error!("({}) connection lost: {}", direction, e);
                        link.schedule_reconnect(&client::classify(&e));
                    }
                    return;
                }
            }
        }
    }

    /// Delivery mode for a rule, per the batching whitelist in the config.
    fn mode_for(&self, filter: &str) -> RouteMode {
        if self.conf.bridge.batched_topics.iter().any(|t| t == filter) {
            RouteMode::Batched(Duration::from_secs(self.conf.bridge.batch_interval))
        } else {
            RouteMode::Immediate
        }
    }

    /// Arm the reconnect timer, replacing any previously armed one.
    fn schedule_reconnect(self: &Arc<Self>, reason: &BridgeError) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.stats.connected.store(false, Ordering::SeqCst);
        self.stats.record_error(reason);

        let delay = self.reconnect_delay(reason);
        warn!("reconnect failed, trying again in {:?}", delay);

        let tx = self.reconnect_tx.clone();
        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        }));
    }

    fn reconnect_delay(&self, reason: &BridgeError) -> Duration {
        match reason {
            BridgeError::BadCredentials(_) => {
                Duration::from_secs(self.conf.bridge.auth_reconnect_delay)
            }
            _ => Duration::from_secs(self.conf.bridge.reconnect_delay),
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn suppressed(&self) -> bool {
        self.tearing_down.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst)
    }

    /// Best-effort teardown of the active client pair. Idempotent and safe
    /// to call in any state.
    async fn disconnect_all(&self) {
        self.stats.connected.store(false, Ordering::SeqCst);
        let Some(conn) = self.conn.lock().await.take() else {
            return;
        };

        debug!("disconnecting clients");
        self.tearing_down.store(true, Ordering::SeqCst);

        for route in &conn.routes {
            route.stop().await;
        }
        let _ = conn.local.disconnect().await;
        let _ = conn.remote.disconnect().await;

        // short grace so the drivers can flush the final publishes and the
        // disconnect packets before they are torn down
        tokio::time::sleep(Duration::from_millis(100)).await;
        for driver in conn.drivers {
            driver.abort();
        }

        self.tearing_down.store(false, Ordering::SeqCst);
    }
}

/// Install every route's subscription on its source client.
///
/// A failure here fails the enclosing connect; partially installed
/// subscriptions are discarded with the clients.
async fn install_subscriptions(
    local: &AsyncClient,
    remote: &AsyncClient,
    local_routes: &[Arc<Route>],
    cloud_routes: &[Arc<Route>],
) -> Result<(), BridgeError> {
    for route in local_routes {
        local
            .subscribe(route.filter(), QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Subscribe(format!("{}: {}", route.filter(), e)))?;
        debug!("(local) subscribed to {}", route.filter());
    }
    for route in cloud_routes {
        remote
            .subscribe(route.filter(), QoS::AtMostOnce)
            .await
            .map_err(|e| BridgeError::Subscribe(format!("{}: {}", route.filter(), e)))?;
        debug!("(cloud) subscribed to {}", route.filter());
    }
    Ok(())
}
