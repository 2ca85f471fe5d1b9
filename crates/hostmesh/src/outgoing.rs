//! # Outgoing channel
//!
//! The locally owned, self-healing channel to one remote host.
//!
//! Two proxies are kept apart on purpose. The ping proxy talks to the remote
//! base endpoint and is driven only by the monitor task; the service proxy
//! talks to the client endpoint and is used only by `call`. Neither ever waits
//! on the other.
//!
//! The service proxy is opened lazily. "Rebuilding" it means discarding the
//! current one; the next attempt opens a fresh session on the remote side.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::address::HostAddress;
use crate::config::ChannelSettings;
use crate::events::EventBus;
use crate::events::SubscriptionId;
use crate::log::Log;
use crate::transport;
use crate::transport::BaseContract;
use crate::transport::Connector;
use crate::transport::EndpointAddress;
use crate::transport::EndpointKind;
use crate::transport::HeaderName;
use crate::transport::MessageHeaders;
use crate::transport::TransportError;

const COMPONENT: &str = "outgoing";

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an outgoing channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Reachability as last observed by the monitor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connected,
}

/// A health transition of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEvent {
    pub channel: ChannelId,
    pub target: HostAddress,
    pub state: ChannelState,
}

/// Outcome of a guarded call. Failure carries no value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResult<R> {
    ok: bool,
    value: Option<R>,
}

impl<R> CallResult<R> {
    fn success(value: R) -> Self {
        Self { ok: true, value: Some(value) }
    }

    fn failure() -> Self {
        Self { ok: false, value: None }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn value(&self) -> Option<&R> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<R> {
        self.value
    }

    /// The value, or `R::default()` for a failed call.
    pub fn value_or_default(self) -> R
    where
        R: Default,
    {
        self.value.unwrap_or_default()
    }
}

/// Both endpoints of a remote service plus the headers identifying us to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEndpoints {
    pub service: EndpointAddress,
    pub base: EndpointAddress,
    pub service_headers: MessageHeaders,
    pub base_headers: MessageHeaders,
}

impl RemoteEndpoints {
    /// Endpoints of `service_name` at `target`, announcing `local_port` as the
    /// port our own host listens on.
    pub fn new(target: &HostAddress, service_name: &str, local_port: &str) -> Self {
        Self {
            service: EndpointAddress::new(target.clone(), service_name, EndpointKind::Client),
            base: EndpointAddress::new(target.clone(), service_name, EndpointKind::Base),
            service_headers: MessageHeaders::new().with(HeaderName::ClientServicePort, local_port),
            base_headers: MessageHeaders::new().with(HeaderName::BaseServicePort, local_port),
        }
    }
}

/// Reconnecting channel to one remote host.
pub struct OutgoingChannel<C: ?Sized + Send + Sync + 'static> {
    id: ChannelId,
    target: HostAddress,
    endpoints: RemoteEndpoints,
    connector: Arc<dyn Connector<C>>,
    settings: ChannelSettings,
    log: Arc<dyn Log>,
    service: Mutex<Option<Arc<C>>>,
    call_lock: tokio::sync::Mutex<()>,
    healthy: AtomicBool,
    connected: AtomicBool,
    disposed: AtomicBool,
    /// Wakes a `call` waiting between attempts.
    dispose_signal: Notify,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<ChannelEvent>,
}

impl<C: ?Sized + Send + Sync + 'static> OutgoingChannel<C> {
    /// Creates a channel. Nothing is opened until `connect` or the first call.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        target: HostAddress,
        endpoints: RemoteEndpoints,
        connector: Arc<dyn Connector<C>>,
        settings: ChannelSettings,
        log: Arc<dyn Log>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
            target,
            endpoints,
            connector,
            settings,
            log,
            service: Mutex::new(None),
            call_lock: tokio::sync::Mutex::new(()),
            healthy: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dispose_signal: Notify::new(),
            monitor: Mutex::new(None),
            events: EventBus::new(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn target(&self) -> &HostAddress {
        &self.target
    }

    pub fn endpoints(&self) -> &RemoteEndpoints {
        &self.endpoints
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Whether the most recent call succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ChannelState {
        if self.connected.load(Ordering::Acquire) {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Starts the monitor task. Calling it again is a no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        *monitor = Some(tokio::spawn(monitor_loop(Arc::downgrade(self))));
    }

    /// Whether the monitor task has been started.
    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Subscribes to every transition.
    pub fn subscribe(&self, handler: impl Fn(ChannelEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(handler)
    }

    /// Fires on each transition to `Connected`.
    pub fn on_connected(&self, handler: impl Fn(ChannelEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(move |event| {
            if event.state == ChannelState::Connected {
                handler(event);
            }
        })
    }

    /// Fires on each transition to `Disconnected`.
    pub fn on_lost_connection(&self, handler: impl Fn(ChannelEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(move |event| {
            if event.state == ChannelState::Disconnected {
                handler(event);
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Runs `action` against the service proxy.
    ///
    /// Calls on one channel never overlap. A failed attempt discards the proxy
    /// and waits out the rest of the attempt budget before trying again, up to
    /// `max_tries` attempts. A policy rejection ends the loop at once. Never
    /// returns an error; exhaustion yields a failed `CallResult`.
    pub async fn call<R, F, Fut>(&self, mut action: F) -> CallResult<R>
    where
        R: Send,
        F: FnMut(Arc<C>) -> Fut + Send,
        Fut: Future<Output = transport::Result<R>> + Send,
    {
        let _guard = self.call_lock.lock().await;
        let max_tries = self.settings.max_tries;

        for attempt in 1..=max_tries {
            if self.is_disposed() {
                break;
            }

            let started = Instant::now();
            match self.attempt(&mut action).await {
                Ok(value) => {
                    self.healthy.store(true, Ordering::Release);
                    return CallResult::success(value);
                }
                Err(e) => {
                    self.healthy.store(false, Ordering::Release);
                    self.log.warn(
                        COMPONENT,
                        &format!("Try: {}/{}, To: {}, Error: {}", attempt, max_tries, self.target, e),
                    );
                    self.rebuild_service();

                    if e.is_rejection() {
                        break;
                    }
                    if attempt < max_tries {
                        self.delay(started).await;
                    }
                }
            }
        }

        CallResult::failure()
    }

    /// `call` for operations without a result.
    pub async fn invoke<F, Fut>(&self, action: F) -> CallResult<()>
    where
        F: FnMut(Arc<C>) -> Fut + Send,
        Fut: Future<Output = transport::Result<()>> + Send,
    {
        self.call(action).await
    }

    /// Stops retries and lets the monitor exit at its next wake.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.service.lock().take();
        self.dispose_signal.notify_waiters();
        self.log.info(COMPONENT, &format!("Disposed channel to {}", self.target));
    }

    async fn attempt<R, F, Fut>(&self, action: &mut F) -> transport::Result<R>
    where
        F: FnMut(Arc<C>) -> Fut + Send,
        Fut: Future<Output = transport::Result<R>> + Send,
    {
        let service = self.service_channel().await?;
        match tokio::time::timeout(self.settings.send_timeout, action(service)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn service_channel(&self) -> transport::Result<Arc<C>> {
        let existing = self.service.lock().clone();
        if let Some(service) = existing {
            return Ok(service);
        }

        let open = self
            .connector
            .open_service(&self.endpoints.service, &self.endpoints.service_headers);
        let service = match tokio::time::timeout(self.settings.open_timeout, open).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout),
        };

        if !self.is_disposed() {
            *self.service.lock() = Some(service.clone());
        }
        self.log.info(COMPONENT, &format!("Create new connection to {}", self.endpoints.service));
        Ok(service)
    }

    fn rebuild_service(&self) {
        self.service.lock().take();
    }

    /// Waits out the rest of the attempt budget, or until disposed.
    async fn delay(&self, started: Instant) {
        let budget = self.settings.effective_operation_timeout();
        let Some(remaining) = budget.checked_sub(started.elapsed()) else { return };
        if remaining.is_zero() {
            return;
        }

        let disposed = self.dispose_signal.notified();
        tokio::pin!(disposed);
        disposed.as_mut().enable();
        if self.is_disposed() {
            return;
        }
        tokio::select! {
            _ = &mut disposed => {}
            _ = tokio::time::sleep(remaining) => {}
        }
    }

    /// One liveness probe. Reopens the ping proxy when there is none.
    async fn probe(&self, ping: &mut Option<Arc<dyn BaseContract>>) -> bool {
        let base = &self.endpoints.base;
        let headers = &self.endpoints.base_headers;
        let connector = &self.connector;
        let current = ping.clone();

        let attempt = async move {
            let channel = match current {
                Some(channel) => channel,
                None => connector.open_base(base, headers).await?,
            };
            let alive = channel.ping().await?;
            Ok::<_, TransportError>((channel, alive))
        };

        match tokio::time::timeout(self.settings.ping_timeout, attempt).await {
            Ok(Ok((channel, true))) => {
                *ping = Some(channel);
                true
            }
            _ => {
                *ping = None;
                false
            }
        }
    }

    fn transition(&self, state: ChannelState) {
        self.connected
            .store(state == ChannelState::Connected, Ordering::Release);
        self.events.emit(ChannelEvent {
            channel: self.id,
            target: self.target.clone(),
            state,
        });
    }
}

impl<C: ?Sized + Send + Sync + 'static> Drop for OutgoingChannel<C> {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl<C: ?Sized + Send + Sync + 'static> fmt::Debug for OutgoingChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingChannel")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("healthy", &self.is_healthy())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Pings forever until the channel is disposed or dropped.
///
/// Fires `Connected` on the first success after being down (including the very
/// first success) and `Disconnected` on the first failure after being up.
/// Repeated outcomes in the same direction fire nothing.
async fn monitor_loop<C: ?Sized + Send + Sync + 'static>(channel: Weak<OutgoingChannel<C>>) {
    let mut ping: Option<Arc<dyn BaseContract>> = None;
    let mut up = false;

    loop {
        let Some(this) = channel.upgrade() else { break };
        if this.is_disposed() {
            break;
        }

        let alive = this.probe(&mut ping).await;
        match (alive, up) {
            (true, false) => {
                this.rebuild_service();
                this.log.info(COMPONENT, &format!("Connected to {}", this.target));
                up = true;
                this.transition(ChannelState::Connected);
            }
            (false, true) => {
                this.log.warn(COMPONENT, &format!("Lost connection to {}", this.target));
                up = false;
                this.transition(ChannelState::Disconnected);
            }
            _ => {}
        }

        let interval = this.settings.ping_interval;
        drop(this);
        tokio::time::sleep(interval).await;
    }
}
