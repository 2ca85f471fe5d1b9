//! # Connection Registry
//!
//! The table of peers, keyed by remote address, shared by application code and
//! by every inbound session.
//!
//! One `parking_lot::Mutex` guards the map and every field of every entry.
//! Peer counts are small, so scans under the lock are fine. The lock is never
//! held across an await, and user code (predicates aside) never runs under it:
//! events go through an [`EventBus`], incoming-connection handlers run on a
//! spawned task, and broadcast actions are spawned one per peer.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::address::HostAddress;
use crate::config::ChannelSettings;
use crate::connection::Connection;
use crate::connection::ConnectionInfo;
use crate::connection::IncomingOperationStatus;
use crate::connection::NewIncomingConnection;
use crate::connection::OutgoingConnection;
use crate::error::Error;
use crate::error::Result;
use crate::events::EventBus;
use crate::events::Handlers;
use crate::events::SubscriptionId;
use crate::log::Log;
use crate::outgoing::ChannelEvent;
use crate::outgoing::ChannelState;
use crate::outgoing::OutgoingChannel;
use crate::outgoing::RemoteEndpoints;
use crate::transport::CallContext;
use crate::transport::Connector;

const COMPONENT: &str = "registry";

/// Health transitions re-published by the registry, carrying the peer's view.
pub enum RegistryEvent<D> {
    Connected(ConnectionInfo<D>),
    LostConnection(ConnectionInfo<D>),
}

impl<D> Clone for RegistryEvent<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Connected(info) => Self::Connected(info.clone()),
            Self::LostConnection(info) => Self::LostConnection(info.clone()),
        }
    }
}

type IncomingHandler<D> = dyn Fn(&mut NewIncomingConnection<D>) + Send + Sync;

/// Result of an inbound insert attempt.
pub(crate) enum Inserted<D> {
    /// A new entry was created.
    New(ConnectionInfo<D>),
    /// Another session created the entry first; its context was refreshed.
    Existing(IncomingOperationStatus),
}

/// Thread-safe map from remote address to connection.
pub struct ConnectionRegistry<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> {
    this: Weak<Self>,
    local_port: String,
    service_name: String,
    connector: Arc<dyn Connector<C>>,
    settings: ChannelSettings,
    log: Arc<dyn Log>,
    connections: Mutex<HashMap<HostAddress, Connection<C, D>>>,
    changed: Notify,
    running: AtomicBool,
    events: EventBus<RegistryEvent<D>>,
    incoming_handlers: Handlers<IncomingHandler<D>>,
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> ConnectionRegistry<C, D> {
    /// Creates an empty registry. `local_port` and `service_name` describe our
    /// own host and are announced on every channel we open.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        local_port: impl Into<String>,
        service_name: impl Into<String>,
        connector: Arc<dyn Connector<C>>,
        settings: ChannelSettings,
        log: Arc<dyn Log>,
    ) -> Arc<Self> {
        let local_port = local_port.into();
        let service_name = service_name.into();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_port,
            service_name,
            connector,
            settings,
            log,
            connections: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            running: AtomicBool::new(true),
            events: EventBus::new(),
            incoming_handlers: Handlers::new(),
        })
    }

    pub fn local_port(&self) -> &str {
        &self.local_port
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Finds or creates the connection to `address` and makes sure it has an
    /// outgoing channel, which is returned.
    ///
    /// An existing entry gets `status` and `data` overwritten. A channel
    /// created here is connected before returning.
    pub fn create_or_update_outgoing(
        &self,
        address: HostAddress,
        status: IncomingOperationStatus,
        data: Option<D>,
    ) -> Result<Arc<OutgoingChannel<C>>> {
        if !self.is_running() {
            self.log.warn(
                COMPONENT,
                &format!("Current host not running, connection to {} aborted", address),
            );
            return Err(Error::NotRunning);
        }
        if !address.is_valid() {
            return Err(Error::InvalidAddress(address.to_string()));
        }

        let data = data.map(Arc::new);
        let (channel, created) = {
            let mut connections = self.connections.lock();
            let connection = connections
                .entry(address.clone())
                .or_insert_with(|| Connection::outbound(address.clone(), status, None));
            connection.status = status;
            connection.data = data;
            match &connection.outgoing {
                Some(existing) => (existing.clone(), false),
                None => {
                    let (channel, subscription) = self.new_channel(&address);
                    connection.attach_outgoing(channel.clone(), subscription);
                    (channel, true)
                }
            }
        };
        self.changed.notify_waiters();

        if created {
            self.log.info(COMPONENT, &format!("Connecting to {}", address));
            channel.connect();
        }
        Ok(channel)
    }

    /// Removes and disposes the first connection matching `predicate`.
    ///
    /// Returns whether one was removed.
    pub fn remove(&self, predicate: impl Fn(&ConnectionInfo<D>) -> bool) -> bool {
        let removed = {
            let mut connections = self.connections.lock();
            let key = connections
                .values()
                .find(|c| predicate(&c.info()))
                .map(|c| c.remote.clone());
            key.and_then(|k| connections.remove(&k))
        };

        let Some(mut connection) = removed else { return false };
        connection.dispose();
        self.changed.notify_waiters();
        self.log.info(
            COMPONENT,
            &format!("Removed {}, connections: {}", connection.remote, self.len()),
        );
        true
    }

    /// Spawns `action` once for every matching connection that has an
    /// outgoing channel. Returns immediately; results must be captured by the
    /// action itself.
    pub fn broadcast_call<P, F, Fut>(&self, predicate: P, action: F)
    where
        P: Fn(&ConnectionInfo<D>) -> bool,
        F: Fn(OutgoingConnection<C, D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let targets: Vec<OutgoingConnection<C, D>> = {
            let connections = self.connections.lock();
            connections
                .values()
                .filter_map(|c| {
                    let outgoing = c.outgoing.clone()?;
                    let info = c.info();
                    predicate(&info).then_some(OutgoingConnection { info, outgoing })
                })
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let action = Arc::new(action);
        for target in targets {
            let action = action.clone();
            tokio::spawn(async move { action(target).await });
        }
    }

    /// Snapshot of every connection.
    pub fn connections(&self) -> Vec<ConnectionInfo<D>> {
        self.connections.lock().values().map(|c| c.info()).collect()
    }

    pub fn get(&self, address: &HostAddress) -> Option<ConnectionInfo<D>> {
        self.connections.lock().get(address).map(|c| c.info())
    }

    /// The outgoing channel to `address`, if one was opened.
    pub fn outgoing(&self, address: &HostAddress) -> Option<Arc<OutgoingChannel<C>>> {
        self.connections
            .lock()
            .get(address)
            .and_then(|c| c.outgoing.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called with the peer's view after each of its channels comes up.
    pub fn on_connected(&self, handler: impl Fn(ConnectionInfo<D>) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(move |event| {
            if let RegistryEvent::Connected(info) = event {
                handler(info);
            }
        })
    }

    /// Called with the peer's view after each of its channels goes down.
    pub fn on_lost_connection(&self, handler: impl Fn(ConnectionInfo<D>) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe(move |event| {
            if let RegistryEvent::LostConnection(info) = event {
                handler(info);
            }
        })
    }

    /// Called once per newly observed inbound peer. The handler decides the
    /// peer's policy and whether to open a return channel.
    pub fn on_incoming_connection(
        &self,
        handler: impl Fn(&mut NewIncomingConnection<D>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.incoming_handlers.add(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id) || self.incoming_handlers.remove(id)
    }

    /// Disposes every connection and refuses further outbound requests.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Connection<C, D>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for mut connection in drained {
            self.log.info(COMPONENT, &format!("Disposing {}", connection.remote));
            connection.dispose();
        }
        self.changed.notify_waiters();
    }

    /// Signalled whenever an entry is inserted, removed or has its policy set.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn log(&self) -> &Arc<dyn Log> {
        &self.log
    }

    /// Refreshes the inbound context of an existing entry and returns its
    /// policy, or `None` if there is no entry for `address`.
    pub(crate) fn refresh_incoming(&self, address: &HostAddress, context: &CallContext) -> Option<IncomingOperationStatus> {
        let mut connections = self.connections.lock();
        let connection = connections.get_mut(address)?;
        connection.incoming = Some(context.clone());
        Some(connection.status)
    }

    /// Inserts an inbound-only entry unless one appeared in the meantime.
    pub(crate) fn insert_incoming(&self, address: &HostAddress, context: &CallContext) -> Inserted<D> {
        let inserted = {
            let mut connections = self.connections.lock();
            match connections.entry(address.clone()) {
                Entry::Occupied(mut existing) => {
                    let connection = existing.get_mut();
                    connection.incoming = Some(context.clone());
                    Inserted::Existing(connection.status)
                }
                Entry::Vacant(slot) => {
                    let connection = slot.insert(Connection::inbound(address.clone(), context.clone()));
                    Inserted::New(connection.info())
                }
            }
        };
        self.changed.notify_waiters();
        inserted
    }

    /// Runs the incoming-connection handlers for `info` on a background task
    /// and applies their decision.
    pub(crate) fn notify_new_incoming(&self, info: ConnectionInfo<D>) {
        let Some(this) = self.this.upgrade() else { return };
        tokio::spawn(async move {
            let mut args = NewIncomingConnection::new(info);
            for handler in this.incoming_handlers.snapshot() {
                handler(&mut args);
            }
            this.apply_incoming_decision(args);
        });
    }

    fn apply_incoming_decision(&self, mut args: NewIncomingConnection<D>) {
        let address = args.connection.address.clone();
        let data = args.take_data().map(Arc::new);

        let opened = {
            let mut connections = self.connections.lock();
            let Some(connection) = connections.get_mut(&address) else {
                // Removed while the handlers ran.
                return;
            };
            if data.is_some() {
                connection.data = data;
            }
            let mut opened = None;
            if args.create_connection_to_remote_host && connection.outgoing.is_none() && self.is_running() {
                let (channel, subscription) = self.new_channel(&address);
                connection.attach_outgoing(channel.clone(), subscription);
                opened = Some(channel);
            }
            connection.status = args.incoming_status;
            opened
        };
        self.changed.notify_waiters();

        self.log.info(
            COMPONENT,
            &format!(
                "Incoming {} resolved, IncomingOperation: {}, return channel: {}",
                address,
                args.incoming_status,
                opened.is_some()
            ),
        );
        if let Some(channel) = opened {
            channel.connect();
        }
    }

    /// Builds a channel to `address` and subscribes the registry to it.
    fn new_channel(&self, address: &HostAddress) -> (Arc<OutgoingChannel<C>>, SubscriptionId) {
        let channel = OutgoingChannel::new(
            address.clone(),
            RemoteEndpoints::new(address, &self.service_name, &self.local_port),
            self.connector.clone(),
            self.settings.clone(),
            self.log.clone(),
        );
        let registry = self.this.clone();
        let subscription = channel.subscribe(move |event| {
            if let Some(registry) = registry.upgrade() {
                registry.forward_channel_event(event);
            }
        });
        (channel, subscription)
    }

    /// Re-publishes a channel transition, if the channel still belongs to the
    /// entry for its target.
    fn forward_channel_event(&self, event: ChannelEvent) {
        let info = {
            let connections = self.connections.lock();
            connections
                .get(&event.target)
                .filter(|c| c.outgoing.as_ref().is_some_and(|o| o.id() == event.channel))
                .map(|c| c.info())
        };
        let Some(info) = info else { return };

        match event.state {
            ChannelState::Connected => self.events.emit(RegistryEvent::Connected(info)),
            ChannelState::Disconnected => self.events.emit(RegistryEvent::LostConnection(info)),
        }
    }
}
