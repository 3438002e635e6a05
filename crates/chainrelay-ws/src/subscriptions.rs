//! Logical subscriptions kept alive across reconnects.
//!
//! One supervisor task owns the physical connection. It walks
//! `Disconnected → Connecting → Connected`, reactivates every registered
//! subscription on entering `Connected`, pings on an interval, and on any
//! disconnect marks every subscription inactive and reconnects with
//! exponential backoff until `max_reconnect_attempts` is exhausted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use chainrelay_core::endpoint::EndpointRegistry;
use chainrelay_core::error::RelayError;

use crate::connection::{PubsubConnection, PubsubConnector, SubscriptionKind, SubscriptionSpec};
use crate::quality::{connection_quality, QualityThresholds};

/// Manager-assigned subscription id. Stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A notification delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub id: SubscriptionId,
    pub kind: SubscriptionKind,
    pub target: Option<String>,
    pub data: Value,
    pub received_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Lifecycle events, broadcast to every [`SubscriptionManager::events`] receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected { url: String },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: reconnect attempts are exhausted.
    GaveUp { attempts: u32 },
    SubscriptionFailed { id: SubscriptionId, error: String },
    Resubscribed { restored: usize, failed: usize },
    QualityChanged { latency: Duration, quality: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WsConfig {
    #[serde(with = "chainrelay_core::serde_ms", rename = "reconnect-base-ms")]
    pub reconnect_base: Duration,
    #[serde(with = "chainrelay_core::serde_ms", rename = "reconnect-max-delay-ms")]
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(with = "chainrelay_core::serde_ms", rename = "ping-interval-ms")]
    pub ping_interval: Duration,
    #[serde(with = "chainrelay_core::serde_ms", rename = "ping-timeout-ms")]
    pub ping_timeout: Duration,
    #[serde(with = "chainrelay_core::serde_ms", rename = "connect-timeout-ms")]
    pub connect_timeout: Duration,
    /// Buffered updates per subscription before delivery waits.
    pub channel_capacity: usize,
    pub event_capacity: usize,
    pub quality: QualityThresholds,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            event_capacity: 64,
            quality: QualityThresholds::default(),
        }
    }
}

/// Handed to [`PubsubConnection::subscribe`]; forwards notifications to the
/// subscriber and stamps `last_update_at`.
#[derive(Clone)]
pub struct SubscriptionSink {
    id: SubscriptionId,
    kind: SubscriptionKind,
    target: Option<String>,
    tx: mpsc::Sender<SubscriptionUpdate>,
    state: Weak<Mutex<State>>,
}

impl SubscriptionSink {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Deliver one notification, waiting for channel capacity.
    /// Returns `false` once the subscriber has dropped its receiver.
    pub async fn deliver(&self, data: Value) -> bool {
        let received_at = Instant::now();
        self.touch(received_at);
        let update = SubscriptionUpdate {
            id: self.id,
            kind: self.kind,
            target: self.target.clone(),
            data,
            received_at,
        };
        self.tx.send(update).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn touch(&self, at: Instant) {
        if let Some(state) = self.state.upgrade() {
            if let Some(sub) = state.lock().unwrap().subscriptions.get_mut(&self.id) {
                sub.last_update_at = Some(at);
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSink")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Snapshot of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub spec: SubscriptionSpec,
    pub active: bool,
    pub handle: Option<u64>,
    /// Failed activations since the last success.
    pub reconnect_attempts: u32,
    pub last_update_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub url: Option<String>,
    pub latency: Option<Duration>,
    /// 0–100, 0 while disconnected.
    pub quality: u8,
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    pub reconnect_attempts: u32,
}

struct Subscription {
    spec: SubscriptionSpec,
    tx: mpsc::Sender<SubscriptionUpdate>,
    active: bool,
    activating: bool,
    handle: Option<u64>,
    reconnect_attempts: u32,
    last_update_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    connection: Option<Arc<dyn PubsubConnection>>,
    url: Option<String>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
    latency: Option<Duration>,
    quality: u8,
    reconnect_attempts: u32,
    gave_up: bool,
}

impl State {
    fn is_current(&self, conn: &Arc<dyn PubsubConnection>) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |c| Arc::ptr_eq(c, conn))
    }
}

enum WatchExit {
    Closed,
    PingFailed(String),
    Requested,
}

impl WatchExit {
    fn reason(&self) -> String {
        match self {
            Self::Closed => "connection closed".to_string(),
            Self::PingFailed(e) => format!("ping failed: {e}"),
            Self::Requested => "reconnect requested".to_string(),
        }
    }
}

struct Core {
    state: Arc<Mutex<State>>,
    registry: Arc<EndpointRegistry>,
    connector: Arc<dyn PubsubConnector>,
    config: WsConfig,
    events: broadcast::Sender<ConnectionEvent>,
    conn_state: watch::Sender<ConnectionState>,
    kick: Notify,
}

impl Core {
    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(20);
        self.config
            .reconnect_base
            .saturating_mul(factor)
            .min(self.config.reconnect_max_delay)
    }

    async fn establish(&self) -> Result<Arc<dyn PubsubConnection>, RelayError> {
        self.conn_state.send_replace(ConnectionState::Connecting);
        let endpoint = self
            .registry
            .select(None)
            .ok_or(RelayError::NoHealthyEndpoint)?;
        let url = endpoint.config.websocket_url();
        let timeout = self.config.connect_timeout;
        let conn = tokio::time::timeout(timeout, self.connector.connect(&url))
            .await
            .map_err(|_| RelayError::timeout(timeout))??;

        {
            let mut state = self.state.lock().unwrap();
            state.connection = Some(conn.clone());
            state.url = Some(url.clone());
            state.reconnect_attempts = 0;
        }
        self.conn_state.send_replace(ConnectionState::Connected);
        tracing::info!(url = %url, "pubsub connected");
        self.emit(ConnectionEvent::Connected { url });
        self.resubscribe_all(&conn).await;
        Ok(conn)
    }

    async fn resubscribe_all(&self, conn: &Arc<dyn PubsubConnection>) {
        let ids: Vec<SubscriptionId> = {
            let mut state = self.state.lock().unwrap();
            // A dropped receiver is an implicit unsubscribe.
            state.subscriptions.retain(|_, s| !s.tx.is_closed());
            state
                .subscriptions
                .iter_mut()
                .filter(|(_, s)| !s.active && !s.activating)
                .map(|(id, s)| {
                    s.activating = true;
                    *id
                })
                .collect()
        };
        if ids.is_empty() {
            return;
        }
        let results = join_all(ids.iter().map(|id| self.activate(conn, *id))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        let restored = ids.len() - failed;
        tracing::info!(restored, failed, "subscriptions reactivated");
        self.emit(ConnectionEvent::Resubscribed { restored, failed });
    }

    /// Open the physical subscription for `id`. The caller has set `activating`.
    async fn activate(
        &self,
        conn: &Arc<dyn PubsubConnection>,
        id: SubscriptionId,
    ) -> Result<(), RelayError> {
        let (spec, sink) = {
            let state = self.state.lock().unwrap();
            let Some(sub) = state.subscriptions.get(&id) else {
                return Ok(());
            };
            let sink = SubscriptionSink {
                id,
                kind: sub.spec.kind,
                target: sub.spec.target.clone(),
                tx: sub.tx.clone(),
                state: Arc::downgrade(&self.state),
            };
            (sub.spec.clone(), sink)
        };

        let result = conn.subscribe(&spec, sink).await;

        let orphan = {
            let mut state = self.state.lock().unwrap();
            let current = state.is_current(conn);
            match state.subscriptions.get_mut(&id) {
                Some(sub) if current => {
                    sub.activating = false;
                    match &result {
                        Ok(handle) => {
                            sub.active = true;
                            sub.handle = Some(*handle);
                            sub.reconnect_attempts = 0;
                        }
                        Err(_) => sub.reconnect_attempts += 1,
                    }
                    None
                }
                // Connection replaced meanwhile; the next resubscribe covers it.
                Some(_) => None,
                // Unsubscribed while activating.
                None if current => result.as_ref().ok().copied(),
                None => None,
            }
        };
        if let Some(handle) = orphan {
            if let Err(e) = conn.unsubscribe(spec.kind, handle).await {
                tracing::debug!(%id, error = %e, "failed to drop orphaned subscription");
            }
        }

        match result {
            Ok(handle) => {
                tracing::debug!(%id, kind = %spec.kind, handle, "subscription active");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%id, kind = %spec.kind, error = %e, "subscription activation failed");
                self.emit(ConnectionEvent::SubscriptionFailed {
                    id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn watch(&self, conn: &Arc<dyn PubsubConnection>) -> WatchExit {
        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut closed = conn.closed();
        loop {
            tokio::select! {
                _ = &mut closed => return WatchExit::Closed,
                _ = self.kick.notified() => return WatchExit::Requested,
                _ = ticker.tick() => {
                    let timeout = self.config.ping_timeout;
                    match tokio::time::timeout(timeout, conn.ping()).await {
                        Ok(Ok(latency)) => self.record_latency(latency),
                        Ok(Err(e)) => return WatchExit::PingFailed(e.to_string()),
                        Err(_) => {
                            return WatchExit::PingFailed(format!(
                                "no pong within {}ms",
                                timeout.as_millis()
                            ))
                        }
                    }
                }
            }
        }
    }

    fn record_latency(&self, latency: Duration) {
        let quality = connection_quality(latency, &self.config.quality);
        let changed = {
            let mut state = self.state.lock().unwrap();
            state.latency = Some(latency);
            let changed = state.quality != quality;
            state.quality = quality;
            changed
        };
        tracing::trace!(latency_ms = latency.as_millis() as u64, quality, "pubsub ping");
        if changed {
            self.emit(ConnectionEvent::QualityChanged { latency, quality });
        }
    }

    fn on_disconnect(&self, reason: &str) {
        let deactivated = {
            let mut state = self.state.lock().unwrap();
            state.connection = None;
            state.quality = 0;
            let mut count = 0;
            for sub in state.subscriptions.values_mut() {
                if sub.active {
                    count += 1;
                }
                sub.active = false;
                sub.activating = false;
                sub.handle = None;
            }
            count
        };
        self.conn_state.send_replace(ConnectionState::Disconnected);
        tracing::warn!(reason, deactivated, "pubsub disconnected");
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    fn set_reconnect_attempts(&self, attempts: u32) {
        self.state.lock().unwrap().reconnect_attempts = attempts;
    }
}

async fn supervise(core: Arc<Core>) {
    let mut attempts: u32 = 0;
    loop {
        match core.establish().await {
            Ok(conn) => {
                attempts = 0;
                let exit = core.watch(&conn).await;
                core.on_disconnect(&exit.reason());
                conn.close().await;
                if matches!(exit, WatchExit::Requested) {
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = attempts, "pubsub connect failed");
                core.conn_state.send_replace(ConnectionState::Disconnected);
            }
        }

        attempts += 1;
        core.set_reconnect_attempts(attempts);
        if attempts > core.config.max_reconnect_attempts {
            let attempts = attempts - 1;
            tracing::error!(attempts, "giving up on pubsub reconnect");
            core.state.lock().unwrap().gave_up = true;
            core.emit(ConnectionEvent::GaveUp { attempts });
            core.conn_state.send_replace(ConnectionState::Disconnected);
            return;
        }
        let delay = core.backoff(attempts);
        tracing::info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        core.emit(ConnectionEvent::Reconnecting {
            attempt: attempts,
            delay,
        });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = core.kick.notified() => {}
        }
    }
}

/// Keeps logical subscriptions alive over one physical pubsub connection.
pub struct SubscriptionManager {
    core: Arc<Core>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        connector: Arc<dyn PubsubConnector>,
        config: WsConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (conn_state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            core: Arc::new(Core {
                state: Arc::new(Mutex::new(State::default())),
                registry,
                connector,
                config,
                events,
                conn_state,
                kick: Notify::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Lifecycle events. Dropping the receiver unsubscribes.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.events.subscribe()
    }

    /// Start the supervisor if it is not running. Returns immediately.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock().unwrap();
        if supervisor.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        self.core.state.lock().unwrap().gave_up = false;
        *supervisor = Some(tokio::spawn(supervise(self.core.clone())));
    }

    /// Start the supervisor and wait for the first connection.
    pub async fn connect(&self) -> Result<(), RelayError> {
        self.start();
        self.wait_connected(self.core.config.connect_timeout).await
    }

    /// Wait until `Connected`. Fails on timeout or once reconnecting gave up.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), RelayError> {
        let mut rx = self.core.conn_state.subscribe();
        let wait = async {
            loop {
                let current = *rx.borrow_and_update();
                if current == ConnectionState::Connected {
                    return Ok(());
                }
                if self.core.state.lock().unwrap().gave_up {
                    return Err(RelayError::Network("pubsub reconnect attempts exhausted".into()));
                }
                if rx.changed().await.is_err() {
                    return Err(RelayError::Shutdown { component: "subscription manager" });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RelayError::timeout(timeout))?
    }

    /// Drop the current connection and reconnect now, skipping any backoff.
    pub fn reconnect(&self) {
        let running = self
            .supervisor
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |h| !h.is_finished());
        if running {
            self.core.kick.notify_one();
        } else {
            self.start();
        }
    }

    /// Stop the supervisor and close the connection. Subscriptions stay
    /// registered (inactive) and are reactivated by the next `connect`.
    pub async fn disconnect(&self) {
        if let Some(task) = self.supervisor.lock().unwrap().take() {
            task.abort();
        }
        let conn = self.core.state.lock().unwrap().connection.clone();
        self.core.on_disconnect("disconnect requested");
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    /// Register a subscription. It is activated now if connected, otherwise on
    /// the next connect. A failed activation leaves it registered and inactive.
    pub async fn subscribe(
        &self,
        spec: SubscriptionSpec,
    ) -> Result<(SubscriptionId, mpsc::Receiver<SubscriptionUpdate>), RelayError> {
        spec.validate()?;
        let (tx, rx) = mpsc::channel(self.core.config.channel_capacity.max(1));
        let (id, conn) = {
            let mut state = self.core.state.lock().unwrap();
            let id = SubscriptionId(state.next_id);
            state.next_id += 1;
            let conn = state.connection.clone();
            tracing::debug!(%id, kind = %spec.kind, address = ?spec.target, "subscription registered");
            state.subscriptions.insert(
                id,
                Subscription {
                    spec,
                    tx,
                    active: false,
                    activating: conn.is_some(),
                    handle: None,
                    reconnect_attempts: 0,
                    last_update_at: None,
                },
            );
            (id, conn)
        };
        if let Some(conn) = conn {
            if let Err(e) = self.core.activate(&conn, id).await {
                tracing::debug!(%id, error = %e, "subscription left inactive until the next connect");
            }
        }
        Ok((id, rx))
    }

    /// Remove a subscription. Returns `false` if `id` is unknown.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (sub, conn) = {
            let mut state = self.core.state.lock().unwrap();
            let Some(sub) = state.subscriptions.remove(&id) else {
                return false;
            };
            (sub, state.connection.clone())
        };
        if let (Some(handle), Some(conn)) = (sub.handle, conn) {
            if let Err(e) = conn.unsubscribe(sub.spec.kind, handle).await {
                tracing::warn!(%id, error = %e, "physical unsubscribe failed");
            }
        }
        tracing::debug!(%id, "unsubscribed");
        true
    }

    pub fn is_connected(&self) -> bool {
        *self.core.conn_state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.core.conn_state.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        let connection_state = self.state();
        let state = self.core.state.lock().unwrap();
        ConnectionStatus {
            state: connection_state,
            url: state.url.clone(),
            latency: state.latency,
            quality: if connection_state == ConnectionState::Connected {
                state.quality
            } else {
                0
            },
            total_subscriptions: state.subscriptions.len(),
            active_subscriptions: state.subscriptions.values().filter(|s| s.active).count(),
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.core
            .state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .map(|(id, s)| SubscriptionInfo {
                id: *id,
                spec: s.spec.clone(),
                active: s.active,
                handle: s.handle,
                reconnect_attempts: s.reconnect_attempts,
                last_update_at: s.last_update_at,
            })
            .collect()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.subscriptions().into_iter().find(|s| s.id == id)
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(task) = supervisor.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use chainrelay_core::endpoint::EndpointConfig;

    struct MockConnection {
        closed: AtomicBool,
        close_signal: Notify,
        next_handle: AtomicU64,
        sinks: Mutex<HashMap<u64, SubscriptionSink>>,
        unsubscribed: Mutex<Vec<u64>>,
        latency: Mutex<Duration>,
        failing_targets: Arc<Mutex<HashSet<String>>>,
    }

    impl MockConnection {
        fn kill(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.close_signal.notify_waiters();
        }

        fn sink_for(&self, id: SubscriptionId) -> Option<SubscriptionSink> {
            self.sinks
                .lock()
                .unwrap()
                .values()
                .find(|s| s.id() == id)
                .cloned()
        }
    }

    #[async_trait]
    impl PubsubConnection for MockConnection {
        async fn subscribe(&self, spec: &SubscriptionSpec, sink: SubscriptionSink) -> Result<u64, RelayError> {
            if let Some(target) = &spec.target {
                if self.failing_targets.lock().unwrap().contains(target) {
                    return Err(RelayError::Network("subscribe rejected".into()));
                }
            }
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            self.sinks.lock().unwrap().insert(handle, sink);
            Ok(handle)
        }

        async fn unsubscribe(&self, _kind: SubscriptionKind, handle: u64) -> Result<(), RelayError> {
            self.sinks.lock().unwrap().remove(&handle);
            self.unsubscribed.lock().unwrap().push(handle);
            Ok(())
        }

        async fn ping(&self) -> Result<Duration, RelayError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RelayError::Network("closed".into()));
            }
            Ok(*self.latency.lock().unwrap())
        }

        async fn closed(&self) {
            let notified = self.close_signal.notified();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }

        async fn close(&self) {
            self.kill();
        }
    }

    #[derive(Default)]
    struct MockConnector {
        failures_left: AtomicU32,
        always_fail: AtomicBool,
        urls: Mutex<Vec<String>>,
        connections: Mutex<Vec<Arc<MockConnection>>>,
        failing_targets: Arc<Mutex<HashSet<String>>>,
    }

    impl MockConnector {
        fn latest(&self) -> Arc<MockConnection> {
            self.connections.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl PubsubConnector for MockConnector {
        async fn connect(&self, url: &str) -> Result<Arc<dyn PubsubConnection>, RelayError> {
            self.urls.lock().unwrap().push(url.to_string());
            if self.always_fail.load(Ordering::SeqCst) {
                return Err(RelayError::Network("refused".into()));
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RelayError::Network("refused".into()));
            }
            let conn = Arc::new(MockConnection {
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
                next_handle: AtomicU64::new(100),
                sinks: Mutex::new(HashMap::new()),
                unsubscribed: Mutex::new(Vec::new()),
                latency: Mutex::new(Duration::from_millis(40)),
                failing_targets: self.failing_targets.clone(),
            });
            self.connections.lock().unwrap().push(conn.clone());
            Ok(conn)
        }
    }

    fn manager(connector: Arc<MockConnector>, config: WsConfig) -> SubscriptionManager {
        let registry = Arc::new(
            EndpointRegistry::new(vec![EndpointConfig::new("https://api.devnet.solana.com", 1)], 3)
                .unwrap(),
        );
        SubscriptionManager::new(registry, connector, config)
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<ConnectionEvent>, mut pred: F) -> ConnectionEvent
    where
        F: FnMut(&ConnectionEvent) -> bool,
    {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    fn all_active(mgr: &SubscriptionManager) -> bool {
        mgr.subscriptions().iter().all(|s| s.active)
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_activate_on_connect_and_receive_updates() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());

        let (id, mut rx) = mgr.subscribe(SubscriptionSpec::account("Acc1")).await.unwrap();
        assert!(!mgr.subscription(id).unwrap().active);

        let mut events = mgr.events();
        mgr.connect().await.unwrap();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Resubscribed { .. })).await;
        assert!(mgr.is_connected());
        assert!(mgr.subscription(id).unwrap().active);
        assert_eq!(connector.urls.lock().unwrap()[0], "wss://api.devnet.solana.com/");

        let sink = connector.latest().sink_for(id).unwrap();
        assert!(sink.deliver(json!({"lamports": 5})).await);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.id, id);
        assert_eq!(update.kind, SubscriptionKind::Account);
        assert_eq!(update.data["lamports"], 5);
        assert!(mgr.subscription(id).unwrap().last_update_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_deactivates_all_then_resubscribes() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        mgr.connect().await.unwrap();

        let mut receivers = Vec::new();
        for target in ["A", "B", "C"] {
            receivers.push(mgr.subscribe(SubscriptionSpec::account(target)).await.unwrap());
        }
        assert!(all_active(&mgr));
        assert_eq!(mgr.status().active_subscriptions, 3);

        let mut events = mgr.events();
        connector.latest().kill();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
        assert!(mgr.subscriptions().iter().all(|s| !s.active && s.handle.is_none()));
        assert!(!mgr.is_connected());

        let reconnecting = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
        assert_eq!(
            reconnecting,
            ConnectionEvent::Reconnecting { attempt: 1, delay: Duration::from_secs(1) }
        );
        let resubscribed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Resubscribed { .. })).await;
        assert_eq!(resubscribed, ConnectionEvent::Resubscribed { restored: 3, failed: 0 });
        assert!(all_active(&mgr));
        assert_eq!(connector.connections.lock().unwrap().len(), 2);
        assert_eq!(connector.latest().sinks.lock().unwrap().len(), 3);
        assert_eq!(mgr.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_reactivation_does_not_block_others() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for target in ["A", "B", "C"] {
            let (id, rx) = mgr.subscribe(SubscriptionSpec::program(target)).await.unwrap();
            ids.push(id);
            receivers.push(rx);
        }
        connector.failing_targets.lock().unwrap().insert("B".into());

        let mut events = mgr.events();
        mgr.connect().await.unwrap();
        let failed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::SubscriptionFailed { .. })).await;
        assert!(matches!(failed, ConnectionEvent::SubscriptionFailed { id, .. } if id == ids[1]));
        let summary = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Resubscribed { .. })).await;
        assert_eq!(summary, ConnectionEvent::Resubscribed { restored: 2, failed: 1 });

        let b = mgr.subscription(ids[1]).unwrap();
        assert!(!b.active);
        assert_eq!(b.reconnect_attempts, 1);
        assert!(mgr.subscription(ids[0]).unwrap().active);
        assert!(mgr.subscription(ids[2]).unwrap().active);

        connector.failing_targets.lock().unwrap().clear();
        mgr.reconnect();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Resubscribed { .. })).await;
        assert!(all_active(&mgr));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_subscribe_stays_registered_until_reconnect() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        mgr.connect().await.unwrap();
        connector.failing_targets.lock().unwrap().insert("A".into());

        let (id, _rx) = mgr.subscribe(SubscriptionSpec::account("A")).await.unwrap();
        let sub = mgr.subscription(id).unwrap();
        assert!(!sub.active);
        assert_eq!(sub.reconnect_attempts, 1);
        assert_eq!(mgr.status().total_subscriptions, 1);

        connector.failing_targets.lock().unwrap().clear();
        let mut events = mgr.events();
        mgr.reconnect();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Resubscribed { .. })).await;
        assert!(mgr.subscription(id).unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let connector = Arc::new(MockConnector::default());
        connector.always_fail.store(true, Ordering::SeqCst);
        let mgr = manager(
            connector.clone(),
            WsConfig {
                max_reconnect_attempts: 3,
                ..Default::default()
            },
        );
        let mut events = mgr.events();
        mgr.start();

        let mut delays = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Reconnecting { delay, .. } => delays.push(delay),
                ConnectionEvent::GaveUp { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(connector.urls.lock().unwrap().len(), 4);
        assert!(mgr.wait_connected(Duration::from_secs(1)).await.is_err());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failures_are_retried() {
        let connector = Arc::new(MockConnector::default());
        connector.failures_left.store(2, Ordering::SeqCst);
        let mgr = manager(connector.clone(), WsConfig::default());
        mgr.connect().await.unwrap();
        assert_eq!(connector.urls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_latency_drives_quality_and_failed_ping_disconnects() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        let mut events = mgr.events();
        mgr.connect().await.unwrap();

        *connector.latest().latency.lock().unwrap() = Duration::from_millis(3000);
        let changed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::QualityChanged { .. })).await;
        assert_eq!(
            changed,
            ConnectionEvent::QualityChanged { latency: Duration::from_millis(3000), quality: 50 }
        );
        assert_eq!(mgr.status().quality, 50);

        connector.latest().closed.store(true, Ordering::SeqCst);
        let down = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
        match down {
            ConnectionEvent::Disconnected { reason } => assert!(reason.contains("ping failed")),
            _ => unreachable!(),
        }
        assert_eq!(mgr.status().quality, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_releases_physical_handle() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        mgr.connect().await.unwrap();
        let (id, _rx) = mgr.subscribe(SubscriptionSpec::slot()).await.unwrap();
        let handle = mgr.subscription(id).unwrap().handle.unwrap();

        assert!(mgr.unsubscribe(id).await);
        assert!(!mgr.unsubscribe(id).await);
        assert_eq!(*connector.latest().unsubscribed.lock().unwrap(), vec![handle]);
        assert_eq!(mgr.status().total_subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_then_connect_restores_subscriptions() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        mgr.connect().await.unwrap();
        let _a = mgr.subscribe(SubscriptionSpec::account("A")).await.unwrap();
        let _b = mgr.subscribe(SubscriptionSpec::logs("all")).await.unwrap();

        mgr.disconnect().await;
        assert!(!mgr.is_connected());
        assert!(mgr.subscriptions().iter().all(|s| !s.active));

        let mut events = mgr.events();
        mgr.connect().await.unwrap();
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Resubscribed { .. })).await;
        assert!(all_active(&mgr));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_receiver_is_forgotten_on_resubscribe() {
        let connector = Arc::new(MockConnector::default());
        let mgr = manager(connector.clone(), WsConfig::default());
        let (_keep, _rx) = mgr.subscribe(SubscriptionSpec::account("A")).await.unwrap();
        let (_gone, rx) = mgr.subscribe(SubscriptionSpec::account("B")).await.unwrap();
        drop(rx);

        mgr.connect().await.unwrap();
        assert_eq!(mgr.status().total_subscriptions, 1);
    }

    #[tokio::test]
    async fn invalid_spec_rejected() {
        let mgr = manager(Arc::new(MockConnector::default()), WsConfig::default());
        let err = mgr
            .subscribe(SubscriptionSpec::new(SubscriptionKind::Account, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
