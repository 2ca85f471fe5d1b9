//! # Host
//!
//! Owns the listening side of one process: the registry, the listener and the
//! dispatcher that runs the session binder for every inbound session.
//!
//! ## Philosophy
//!
//! - **Explicit Construction**: Service instances are built by a
//!   [`ServiceFactory`] the application passes in, once per accepted client
//!   session. The factory receives everything it may need in a [`Session`].
//! - **Local Ownership**: A host only ever holds addresses of its peers. The
//!   registry handle given to services is weak, so two hosts in one process
//!   never keep each other alive.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::address::HostAddress;
use crate::binder::BoundSession;
use crate::binder::SessionBinder;
use crate::config::HostConfig;
use crate::connection::ConnectionInfo;
use crate::connection::IncomingOperationStatus;
use crate::connection::NewIncomingConnection;
use crate::connection::OutgoingConnection;
use crate::error::Error;
use crate::error::Result;
use crate::events::SubscriptionId;
use crate::fault::ServiceErrorHandler;
use crate::outgoing::OutgoingChannel;
use crate::registry::ConnectionRegistry;
use crate::transport;
use crate::transport::BaseContract;
use crate::transport::CallContext;
use crate::transport::Connector;
use crate::transport::Dispatcher;
use crate::transport::EndpointKind;
use crate::transport::HeaderName;
use crate::transport::ListenAddress;
use crate::transport::Listener;
use crate::transport::Transport;

const COMPONENT: &str = "host";

/// What a service instance is constructed from.
pub struct Session<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> {
    bound: BoundSession,
    context: CallContext,
    registry: Weak<ConnectionRegistry<C, D>>,
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> Session<C, D> {
    /// The caller's registry key.
    pub fn address(&self) -> &HostAddress {
        &self.bound.address
    }

    pub fn header(&self) -> HeaderName {
        self.bound.header
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn is_aborted(&self) -> bool {
        self.context.is_aborted()
    }

    /// Current view of the caller's connection.
    pub fn connection(&self) -> Option<ConnectionInfo<D>> {
        self.registry.upgrade()?.get(&self.bound.address)
    }

    /// The local registry, while the host is alive.
    pub fn registry(&self) -> Option<Arc<ConnectionRegistry<C, D>>> {
        self.registry.upgrade()
    }
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> Clone for Session<C, D> {
    fn clone(&self) -> Self {
        Self {
            bound: self.bound.clone(),
            context: self.context.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> fmt::Debug for Session<C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.bound.address)
            .field("header", &self.bound.header)
            .field("context", &self.context)
            .finish()
    }
}

/// Builds the service instance for an accepted client session.
pub trait ServiceFactory<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static>: Send + Sync + 'static {
    fn create(&self, session: Session<C, D>) -> anyhow::Result<Arc<C>>;
}

impl<C, D, F> ServiceFactory<C, D> for F
where
    C: ?Sized + Send + Sync + 'static,
    D: Send + Sync + 'static,
    F: Fn(Session<C, D>) -> anyhow::Result<Arc<C>> + Send + Sync + 'static,
{
    fn create(&self, session: Session<C, D>) -> anyhow::Result<Arc<C>> {
        self(session)
    }
}

/// The base contract every host serves.
#[derive(Copy, Clone, Debug, Default)]
pub struct PingService;

#[async_trait::async_trait]
impl BaseContract for PingService {
    async fn ping(&self) -> transport::Result<bool> {
        Ok(true)
    }
}

struct HostDispatcher<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> {
    binder: SessionBinder<C, D>,
    registry: Weak<ConnectionRegistry<C, D>>,
    factory: Arc<dyn ServiceFactory<C, D>>,
    faults: ServiceErrorHandler,
}

#[async_trait::async_trait]
impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> Dispatcher<C> for HostDispatcher<C, D> {
    async fn accept_service(&self, context: CallContext) -> transport::Result<Arc<C>> {
        let bound = self.binder.bind(&context).await.map_err(|e| self.faults.reject(e))?;
        let session = Session {
            bound,
            context,
            registry: self.registry.clone(),
        };
        self.factory
            .create(session)
            .map_err(|e| self.faults.reject(e.into()))
    }

    async fn accept_base(&self, context: CallContext) -> transport::Result<Arc<dyn BaseContract>> {
        self.binder.bind(&context).await.map_err(|e| self.faults.reject(e))?;
        Ok(Arc::new(PingService))
    }
}

/// A listening host and its connection registry.
pub struct HostManager<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> {
    config: HostConfig,
    address: ListenAddress,
    registry: Arc<ConnectionRegistry<C, D>>,
    listener: Mutex<Option<Box<dyn Listener>>>,
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> HostManager<C, D> {
    /// Starts listening on `config.ip:config.port` with both endpoints of
    /// `config.service_name`.
    pub async fn start<T, F>(config: HostConfig, transport: Arc<T>, factory: F) -> Result<Arc<Self>>
    where
        T: Transport<C>,
        F: ServiceFactory<C, D>,
    {
        let log = config.log.clone();
        let connector: Arc<dyn Connector<C>> = transport.clone();
        let registry = ConnectionRegistry::new(
            config.port.clone(),
            config.service_name.clone(),
            connector,
            config.channel.clone(),
            log.clone(),
        );

        let dispatcher = Arc::new(HostDispatcher {
            binder: SessionBinder::new(registry.clone(), config.binder.clone()),
            registry: Arc::downgrade(&registry),
            factory: Arc::new(factory),
            faults: ServiceErrorHandler::new(log.clone()),
        });

        let address = ListenAddress {
            host: HostAddress::new(config.ip.clone(), config.port.clone()),
            service: config.service_name.clone(),
        };
        let listener = match transport.listen(address.clone(), dispatcher).await {
            Ok(listener) => listener,
            Err(e) => {
                log.error(COMPONENT, &format!("Failed to start host at {}: {}", address.host, e));
                registry.shutdown();
                return Err(Error::Listen(e));
            }
        };

        log.info(
            COMPONENT,
            &format!("Host started at {}", address.endpoint(EndpointKind::Client)),
        );
        Ok(Arc::new(Self {
            config,
            address,
            registry,
            listener: Mutex::new(Some(listener)),
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The address peers reach this host at.
    pub fn address(&self) -> &HostAddress {
        &self.address.host
    }

    pub fn listen_address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C, D>> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    pub fn create_or_update_outgoing(
        &self,
        address: HostAddress,
        status: IncomingOperationStatus,
        data: Option<D>,
    ) -> Result<Arc<OutgoingChannel<C>>> {
        self.registry.create_or_update_outgoing(address, status, data)
    }

    pub fn remove(&self, predicate: impl Fn(&ConnectionInfo<D>) -> bool) -> bool {
        self.registry.remove(predicate)
    }

    pub fn broadcast_call<P, F, Fut>(&self, predicate: P, action: F)
    where
        P: Fn(&ConnectionInfo<D>) -> bool,
        F: Fn(OutgoingConnection<C, D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.broadcast_call(predicate, action)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo<D>> {
        self.registry.connections()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn on_incoming_connection(
        &self,
        handler: impl Fn(&mut NewIncomingConnection<D>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.registry.on_incoming_connection(handler)
    }

    pub fn on_connected(&self, handler: impl Fn(ConnectionInfo<D>) + Send + Sync + 'static) -> SubscriptionId {
        self.registry.on_connected(handler)
    }

    pub fn on_lost_connection(&self, handler: impl Fn(ConnectionInfo<D>) + Send + Sync + 'static) -> SubscriptionId {
        self.registry.on_lost_connection(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Closes the listener and disposes every connection. Idempotent.
    pub fn shutdown(&self) {
        let Some(listener) = self.listener.lock().take() else { return };
        listener.close();
        self.registry.shutdown();
        self.config.log.info(COMPONENT, &format!("Host at {} stopped", self.address.host));
    }
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> Drop for HostManager<C, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> fmt::Debug for HostManager<C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostManager")
            .field("address", &self.address)
            .field("running", &self.is_running())
            .field("connections", &self.len())
            .finish()
    }
}
