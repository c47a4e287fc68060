//! One BLE session with one hub
//!
//! A [`Session`] owns device selection, the link lifecycle, the
//! characteristic cache and the notification registry. UIs observe it
//! through [`Session::watch`] (current snapshot) and [`Session::subscribe`]
//! (state changes, notices and status notifications). None of the lifecycle
//! calls fail: they always land the session in some [`ConnectionState`].

use std::sync::{Arc, Mutex, Weak};

use robohub_proto::{CharacteristicKey, Endpoint, Payload, ProtocolVersion};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::cache::CharacteristicCache;
use crate::config::SessionConfig;
use crate::error::{BleError, Result};
use crate::notify::{Handler, NotificationRouter};
use crate::reconnect::{self, Outcome, ReconnectPolicy, RetryState};
use crate::transport::{
    CharacteristicHandle, DiscoveryFilter, GattTransport, LinkEvent, PeripheralId, PeripheralInfo,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Requesting,
    Connected,
    Reconnecting,
    Error(String),
    Unsupported,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Requesting => f.write_str("requesting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Error(message) => write!(f, "error: {message}"),
            ConnectionState::Unsupported => f.write_str("unsupported"),
        }
    }
}

/// What a UI renders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub device_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Short human readable message for every notable change
    Notice { level: NoticeLevel, message: String },
    /// Decoded value pushed by a status characteristic
    Notification {
        key: CharacteristicKey,
        endpoint: Option<Endpoint>,
        payload: Payload,
    },
}

struct Inner {
    transport: Arc<dyn GattTransport>,
    config: SessionConfig,
    policy: ReconnectPolicy,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    peripheral: Mutex<Option<PeripheralInfo>>,
    cache: CharacteristicCache,
    router: NotificationRouter,
    retry: RetryState,
    operations: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones drive the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Must be called inside a tokio runtime: the link event pump is spawned here.
    pub fn new(transport: Arc<dyn GattTransport>, config: SessionConfig) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(64);
        let link_events = transport.events();

        let inner = Arc::new(Inner {
            transport,
            policy: config.reconnect_policy(),
            config,
            snapshot,
            events,
            peripheral: Mutex::new(None),
            cache: CharacteristicCache::new(),
            router: NotificationRouter::new(),
            retry: RetryState::new(),
            operations: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_link_events(Arc::downgrade(&inner), link_events));
        *lock(&inner.pump) = Some(pump);
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.config.protocol
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.snapshot.borrow().state.clone()
    }

    pub fn device_name(&self) -> Option<String> {
        self.inner.snapshot.borrow().device_name.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.snapshot.borrow().error.clone()
    }

    pub fn peripheral(&self) -> Option<PeripheralInfo> {
        lock(&self.inner.peripheral).clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &CharacteristicCache {
        &self.inner.cache
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.inner.router
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.retry.is_running()
    }

    /// Dismiss the recorded error without touching the state
    pub fn clear_error(&self) {
        self.inner.snapshot.send_if_modified(|s| s.error.take().is_some());
    }

    /// Select a hub and open the link. Returns the state the session landed in.
    pub async fn connect(&self) -> ConnectionState {
        let inner = &self.inner;
        let epoch = inner.retry.restart();

        let previous = lock(&inner.peripheral).take();
        if let Some(previous) = previous {
            tracing::info!(device = %previous.display_name(), "replacing selected device");
            inner.router.teardown(inner.transport.as_ref(), Some(&previous.id)).await;
            inner.cache.invalidate();
            if let Err(e) = inner.transport.disconnect(&previous.id).await {
                tracing::debug!("disconnecting previous device failed: {e}");
            }
        }

        inner.update(|s| {
            s.state = ConnectionState::Requesting;
            s.device_name = None;
            s.error = None;
        });

        if !inner.transport.is_available().await {
            let message = BleError::Unsupported("no bluetooth adapter found".to_string()).to_string();
            inner.update(|s| {
                s.state = ConnectionState::Unsupported;
                s.error = Some(message.clone());
            });
            inner.notice(NoticeLevel::Warning, message);
            return ConnectionState::Unsupported;
        }

        let filter = DiscoveryFilter {
            optional_services: inner.config.protocol.services().to_vec(),
            target: inner.config.device.clone(),
        };

        let info = match inner.transport.request_peripheral(&filter).await {
            Ok(info) => info,
            Err(BleError::SelectionCancelled) => {
                let message = BleError::SelectionCancelled.to_string();
                inner.update(|s| {
                    s.state = ConnectionState::Idle;
                    s.error = Some(message.clone());
                });
                inner.notice(NoticeLevel::Info, message);
                return ConnectionState::Idle;
            }
            Err(BleError::Unsupported(reason)) => {
                let message = BleError::Unsupported(reason).to_string();
                inner.update(|s| {
                    s.state = ConnectionState::Unsupported;
                    s.error = Some(message.clone());
                });
                inner.notice(NoticeLevel::Warning, message);
                return ConnectionState::Unsupported;
            }
            Err(e) => return inner.fail(e.to_string()),
        };

        if inner.superseded(epoch) {
            tracing::debug!("selection finished after the session moved on");
            return self.status();
        }

        let name = info.display_name();
        tracing::info!(device = %name, id = %info.id, "device selected");
        *lock(&inner.peripheral) = Some(info.clone());
        inner.update(|s| s.device_name = Some(name.clone()));

        if inner.config.connect_on_select && !inner.transport.is_connected(&info.id).await {
            if let Err(e) = inner.transport.connect(&info.id).await {
                tracing::warn!(device = %name, "connect after selection failed: {e}");
            }
        }

        if inner.superseded(epoch) {
            return self.status();
        }

        if inner.transport.is_connected(&info.id).await {
            inner.retry.reset();
            inner.set_state(ConnectionState::Connected);
            inner.notice(NoticeLevel::Success, format!("Connected to {name}"));
            inner.subscribe_status().await;
            ConnectionState::Connected
        } else {
            inner.set_state(ConnectionState::Idle);
            inner.notice(NoticeLevel::Info, format!("Selected {name}"));
            ConnectionState::Idle
        }
    }

    /// Tear the link down on purpose. Safe to call in any state.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.retry.set_manual();

        let previous = lock(&inner.peripheral).take();
        let id = previous.as_ref().map(|p| p.id.clone());
        inner.router.teardown(inner.transport.as_ref(), id.as_ref()).await;
        inner.cache.invalidate();

        if let Some(id) = &id {
            if let Err(e) = inner.transport.disconnect(id).await {
                tracing::debug!(%id, "disconnect failed: {e}");
            }
        }

        let was_active = matches!(
            inner.snapshot.borrow().state,
            ConnectionState::Connected | ConnectionState::Reconnecting | ConnectionState::Requesting
        );
        inner.update(|s| {
            if was_active || previous.is_some() {
                s.state = ConnectionState::Idle;
            }
            s.device_name = None;
        });

        if let Some(previous) = previous {
            inner.notice(NoticeLevel::Info, format!("Disconnected from {}", previous.display_name()));
        }
    }

    /// Disconnect and stop the link event pump
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
    }

    /// Resolve a logical endpoint through the cache
    pub async fn resolve(&self, endpoint: Endpoint) -> Result<CharacteristicHandle> {
        let key = self.key(endpoint)?;
        let id = self.peripheral().map(|p| p.id);
        self.inner
            .cache
            .resolve(self.inner.transport.as_ref(), id.as_ref(), key)
            .await
    }

    pub async fn read_endpoint(&self, endpoint: Endpoint) -> Result<Payload> {
        let (id, handle) = self.resolve_with_id(endpoint).await?;
        let value = self.inner.transport.read_value(&id, &handle).await?;
        tracing::debug!(%endpoint, len = value.len(), "read");
        Ok(Payload::decode(&value))
    }

    pub async fn write_endpoint(&self, endpoint: Endpoint, value: &[u8]) -> Result<()> {
        let (id, handle) = self.resolve_with_id(endpoint).await?;
        tracing::debug!(%endpoint, len = value.len(), "write");
        self.inner.transport.write_value(&id, &handle, value).await
    }

    /// Serialises protocol exchanges issued through any clone of this session
    pub(crate) async fn lock_operations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.operations.lock().await
    }

    pub(crate) fn key(&self, endpoint: Endpoint) -> Result<CharacteristicKey> {
        let version = self.protocol();
        version
            .key(endpoint)
            .ok_or(BleError::EndpointUnavailable { endpoint, version })
    }

    async fn resolve_with_id(&self, endpoint: Endpoint) -> Result<(PeripheralId, CharacteristicHandle)> {
        let handle = self.resolve(endpoint).await?;
        let id = self
            .peripheral()
            .map(|p| p.id)
            .ok_or_else(|| BleError::LinkUnavailable("no device selected".to_string()))?;
        Ok((id, handle))
    }
}

impl Inner {
    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let mut changed_state = None;
        self.snapshot.send_if_modified(|s| {
            let before = s.clone();
            f(s);
            if s.state != before.state {
                changed_state = Some(s.state.clone());
            }
            *s != before
        });
        if let Some(state) = changed_state {
            tracing::info!(%state, "session state changed");
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.update(|s| s.state = state);
    }

    fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state.clone()
    }

    fn fail(&self, message: String) -> ConnectionState {
        tracing::warn!("{message}");
        self.update(|s| {
            s.state = ConnectionState::Error(message.clone());
            s.error = Some(message.clone());
        });
        self.notice(NoticeLevel::Error, message.clone());
        ConnectionState::Error(message)
    }

    fn notice(&self, level: NoticeLevel, message: String) {
        let _ = self.events.send(SessionEvent::Notice { level, message });
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.retry.is_manual() || self.retry.epoch() != epoch
    }

    fn current_id(&self) -> Option<PeripheralId> {
        lock(&self.peripheral).as_ref().map(|p| p.id.clone())
    }

    fn notification_handler(&self) -> Handler {
        let events = self.events.clone();
        let protocol = self.config.protocol;
        Arc::new(move |key, payload| {
            let endpoint = protocol.endpoint(&key);
            tracing::debug!(%key, %payload, "notification");
            let _ = events.send(SessionEvent::Notification { key, endpoint, payload });
        })
    }

    /// Subscribe every status characteristic of the active protocol
    async fn subscribe_status(&self) {
        let Some(id) = self.current_id() else {
            return;
        };
        let protocol = self.config.protocol;
        for endpoint in protocol.status_endpoints() {
            let Some(key) = protocol.key(*endpoint) else {
                continue;
            };
            let subscribed = match self.cache.resolve(self.transport.as_ref(), Some(&id), key).await {
                Ok(handle) if !handle.flags.notify => {
                    tracing::warn!(%endpoint, "characteristic does not support notifications");
                    continue;
                }
                Ok(handle) => {
                    self.router
                        .subscribe(self.transport.as_ref(), &id, handle, self.notification_handler())
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = subscribed {
                tracing::warn!(%endpoint, "status notifications unavailable: {e}");
            }
        }
    }

    async fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Connected(id) => {
                // Requesting and Reconnecting settle the state themselves
                let settled = matches!(self.state(), ConnectionState::Idle | ConnectionState::Error(_));
                if self.current_id().as_ref() != Some(&id) || !settled {
                    return;
                }
                tracing::info!(%id, "link came up");
                self.retry.reset();
                self.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.error = None;
                });
                self.subscribe_status().await;
            }
            LinkEvent::Disconnected(id) => self.link_lost(id).await,
            LinkEvent::ValueChanged {
                peripheral,
                characteristic,
                value,
            } => {
                if self.current_id().as_ref() != Some(&peripheral) {
                    return;
                }
                if !self.router.dispatch(characteristic, &value) {
                    tracing::debug!(%characteristic, "value change without a subscriber");
                }
            }
        }
    }

    async fn link_lost(self: &Arc<Self>, id: PeripheralId) {
        let Some(info) = lock(&self.peripheral).clone() else {
            return;
        };
        if info.id != id {
            tracing::debug!(%id, "ignoring disconnect of a stale device");
            return;
        }
        if self.transport.is_connected(&id).await {
            tracing::debug!(%id, "ignoring disconnect, link is up again");
            return;
        }

        let was_connected = self.state() == ConnectionState::Connected;
        self.cache.invalidate();
        self.router.teardown(self.transport.as_ref(), Some(&id)).await;
        if !was_connected {
            return;
        }

        self.set_state(ConnectionState::Idle);
        if self.retry.is_manual() {
            return;
        }

        self.notice(NoticeLevel::Warning, format!("Connection to {} lost", info.display_name()));
        self.spawn_supervisor(info);
    }

    fn spawn_supervisor(self: &Arc<Self>, info: PeripheralInfo) {
        if !self.retry.try_begin() {
            tracing::debug!("reconnect loop already running");
            return;
        }
        let epoch = self.retry.epoch();
        self.set_state(ConnectionState::Reconnecting);

        let inner = self.clone();
        tokio::spawn(async move {
            let id = info.id.clone();
            let outcome = reconnect::supervise(&inner.policy, &inner.retry, epoch, |attempt| {
                let inner = inner.clone();
                let id = id.clone();
                async move { inner.reconnect_once(&id, attempt).await }
            })
            .await;
            inner.retry.finish();

            let outcome = match outcome {
                Outcome::Reconnected | Outcome::Exhausted if inner.superseded(epoch) => Outcome::Cancelled,
                other => other,
            };

            match outcome {
                Outcome::Reconnected => {
                    inner.retry.reset();
                    inner.update(|s| {
                        s.state = ConnectionState::Connected;
                        s.error = None;
                    });
                    inner.notice(NoticeLevel::Success, format!("Reconnected to {}", info.display_name()));
                    inner.subscribe_status().await;
                }
                Outcome::Exhausted => {
                    tracing::error!(device = %info.display_name(), "giving up on reconnect");
                    inner.fail(BleError::ReconnectExhausted.to_string());
                }
                Outcome::Cancelled => {
                    tracing::debug!(%id, "reconnect loop cancelled");
                    if inner.current_id().as_ref() != Some(&id) && inner.transport.is_connected(&id).await {
                        let _ = inner.transport.disconnect(&id).await;
                    }
                }
            }
        });
    }

    async fn reconnect_once(&self, id: &PeripheralId, attempt: u32) -> bool {
        tracing::info!(%id, attempt = attempt + 1, of = self.policy.max_retries, "reconnecting");
        if let Err(e) = self.transport.connect(id).await {
            tracing::debug!(%id, "reconnect attempt failed: {e}");
        }
        self.transport.is_connected(id).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

async fn pump_link_events(session: Weak<Inner>, mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "link events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.handle_link_event(event).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
