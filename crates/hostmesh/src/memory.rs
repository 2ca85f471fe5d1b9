//! # In-memory transport
//!
//! A process-local network for running several hosts side by side without
//! sockets. Opening a channel runs the remote host's dispatcher (and so its
//! session binder) directly and hands back the proxy it produced.
//!
//! Base proxies are wrapped so that pings notice a closed listener, an aborted
//! session or an injected outage. Service proxies are returned as produced;
//! services that care can check their session's `is_aborted`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;

use crate::address::HostAddress;
use crate::address::normalize_ip;
use crate::transport;
use crate::transport::Acceptor;
use crate::transport::BaseContract;
use crate::transport::CallContext;
use crate::transport::ChannelControl;
use crate::transport::Connector;
use crate::transport::Dispatcher;
use crate::transport::EndpointAddress;
use crate::transport::EndpointKind;
use crate::transport::ListenAddress;
use crate::transport::Listener;
use crate::transport::MessageHeaders;
use crate::transport::TransportError;

struct Registration<C: ?Sized + Send + Sync + 'static> {
    id: u64,
    service: String,
    dispatcher: Arc<dyn Dispatcher<C>>,
}

struct NetworkInner<C: ?Sized + Send + Sync + 'static> {
    listeners: DashMap<HostAddress, Registration<C>>,
    unreachable: DashSet<HostAddress>,
    next_id: AtomicU64,
}

impl<C: ?Sized + Send + Sync + 'static> NetworkInner<C> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_reachable(&self, address: &HostAddress) -> bool {
        !self.unreachable.contains(address)
    }

    /// Whether the listener `id` still serves `address`.
    fn is_listening(&self, address: &HostAddress, id: u64) -> bool {
        self.listeners.get(address).is_some_and(|r| r.id == id)
    }

    /// Finds the dispatcher serving `endpoint`, returning it with its id.
    fn resolve(&self, endpoint: &EndpointAddress) -> transport::Result<(HostAddress, u64, Arc<dyn Dispatcher<C>>)> {
        let address = key(&endpoint.host);
        if !self.is_reachable(&address) {
            return Err(TransportError::Unreachable(endpoint.uri()));
        }
        let registration = self
            .listeners
            .get(&address)
            .filter(|r| r.service == endpoint.service)
            .ok_or_else(|| TransportError::Unreachable(endpoint.uri()))?;
        Ok((address, registration.id, registration.dispatcher.clone()))
    }
}

fn key(address: &HostAddress) -> HostAddress {
    HostAddress::new(normalize_ip(address.ip()), address.port())
}

/// Shared listener table. Cloning yields another handle to the same network.
pub struct MemoryNetwork<C: ?Sized + Send + Sync + 'static> {
    inner: Arc<NetworkInner<C>>,
}

impl<C: ?Sized + Send + Sync + 'static> MemoryNetwork<C> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listeners: DashMap::new(),
                unreachable: DashSet::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A transport whose outbound channels report `local_ip` as the caller.
    pub fn transport(&self, local_ip: impl Into<String>) -> Arc<MemoryTransport<C>> {
        Arc::new(MemoryTransport {
            network: self.inner.clone(),
            local_ip: normalize_ip(&local_ip.into()),
        })
    }

    /// Simulates an outage of `address`. Opens and pings to it fail with
    /// `Unreachable` until it is made reachable again.
    pub fn set_reachable(&self, address: &HostAddress, reachable: bool) {
        let address = key(address);
        if reachable {
            self.inner.unreachable.remove(&address);
        } else {
            self.inner.unreachable.insert(address);
        }
    }

    pub fn is_listening(&self, address: &HostAddress) -> bool {
        self.inner.listeners.contains_key(&key(address))
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl<C: ?Sized + Send + Sync + 'static> Clone for MemoryNetwork<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: ?Sized + Send + Sync + 'static> Default for MemoryNetwork<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of the in-memory network.
pub struct MemoryTransport<C: ?Sized + Send + Sync + 'static> {
    network: Arc<NetworkInner<C>>,
    local_ip: String,
}

impl<C: ?Sized + Send + Sync + 'static> MemoryTransport<C> {
    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    fn context(&self, headers: &MessageHeaders, endpoint: EndpointKind) -> (CallContext, Arc<MemorySession>) {
        let session = Arc::new(MemorySession::default());
        let context = CallContext {
            remote_ip: self.local_ip.clone(),
            headers: headers.clone(),
            session_id: self.network.next_id(),
            endpoint,
            channel: session.clone(),
        };
        (context, session)
    }
}

impl<C: ?Sized + Send + Sync + 'static> fmt::Debug for MemoryTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("local_ip", &self.local_ip)
            .finish()
    }
}

#[async_trait::async_trait]
impl<C: ?Sized + Send + Sync + 'static> Connector<C> for MemoryTransport<C> {
    async fn open_service(&self, endpoint: &EndpointAddress, headers: &MessageHeaders) -> transport::Result<Arc<C>> {
        let (_, _, dispatcher) = self.network.resolve(endpoint)?;
        let (context, _) = self.context(headers, EndpointKind::Client);
        dispatcher.accept_service(context).await
    }

    async fn open_base(&self, endpoint: &EndpointAddress, headers: &MessageHeaders) -> transport::Result<Arc<dyn BaseContract>> {
        let (address, listener, dispatcher) = self.network.resolve(endpoint)?;
        let (context, session) = self.context(headers, EndpointKind::Base);
        let inner = dispatcher.accept_base(context).await?;
        Ok(Arc::new(MemoryPing {
            network: self.network.clone(),
            address,
            listener,
            session,
            inner,
        }))
    }
}

#[async_trait::async_trait]
impl<C: ?Sized + Send + Sync + 'static> Acceptor<C> for MemoryTransport<C> {
    async fn listen(&self, address: ListenAddress, dispatcher: Arc<dyn Dispatcher<C>>) -> transport::Result<Box<dyn Listener>> {
        let host = key(&address.host);
        let id = self.network.next_id();
        match self.network.listeners.entry(host.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::Communication(format!("Address already in use: {}", host)));
            }
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    id,
                    service: address.service.clone(),
                    dispatcher,
                });
            }
        }
        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            host,
            id,
            address,
        }))
    }
}

struct MemoryListener<C: ?Sized + Send + Sync + 'static> {
    network: Arc<NetworkInner<C>>,
    host: HostAddress,
    id: u64,
    address: ListenAddress,
}

impl<C: ?Sized + Send + Sync + 'static> Listener for MemoryListener<C> {
    fn local_address(&self) -> &ListenAddress {
        &self.address
    }

    fn close(&self) {
        self.network.listeners.remove_if(&self.host, |_, r| r.id == self.id);
    }
}

/// Abort flag of one in-memory session.
#[derive(Debug, Default)]
pub struct MemorySession {
    aborted: AtomicBool,
}

impl ChannelControl for MemorySession {
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Base proxy that fails once its session or listener is gone.
struct MemoryPing<C: ?Sized + Send + Sync + 'static> {
    network: Arc<NetworkInner<C>>,
    address: HostAddress,
    listener: u64,
    session: Arc<MemorySession>,
    inner: Arc<dyn BaseContract>,
}

#[async_trait::async_trait]
impl<C: ?Sized + Send + Sync + 'static> BaseContract for MemoryPing<C> {
    async fn ping(&self) -> transport::Result<bool> {
        if !self.network.is_reachable(&self.address) {
            return Err(TransportError::Unreachable(self.address.to_string()));
        }
        if !self.network.is_listening(&self.address, self.listener) {
            return Err(TransportError::ConnectionLost(self.address.to_string()));
        }
        if self.session.is_aborted() {
            return Err(TransportError::Aborted);
        }
        self.inner.ping().await
    }
}
