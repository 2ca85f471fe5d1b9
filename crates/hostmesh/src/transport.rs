//! # Transport Abstraction
//!
//! The seam between the session layer and whatever actually carries calls.
//!
//! ## Philosophy
//!
//! - **Contract-Oriented**: A transport hands out proxies implementing the
//!   application contract `C` and the base contract. It knows nothing about
//!   registries, policies or retries.
//! - **Session Per Open**: Opening a channel is what creates an inbound session
//!   on the remote side. The remote host runs its session binder exactly once
//!   per open, through the [`Dispatcher`] it registered when listening.
//! - **Request-Response**: Every contract method is a single awaited call that
//!   may fail with a [`TransportError`]. No streaming.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::address::HostAddress;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing is listening at the target, or the route to it is down.
    Unreachable(String),
    /// The peer dropped an established channel.
    ConnectionLost(String),
    /// The operation timed out before a response was received.
    Timeout,
    /// The channel was aborted by either side.
    Aborted,
    /// Transport security could not be negotiated.
    SecurityNegotiation(String),
    /// Generic communication failure.
    Communication(String),
    /// The remote host refused this session by policy. Terminal; retrying the
    /// same call will not change the answer.
    Rejected(String),
    /// The remote host faulted while handling the call.
    Fault(String),
}

impl TransportError {
    /// Whether the failure is a policy decision rather than a transient fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable(msg) => write!(f, "Unreachable: {}", msg),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Aborted => write!(f, "Channel aborted"),
            Self::SecurityNegotiation(msg) => write!(f, "Security negotiation failed: {}", msg),
            Self::Communication(msg) => write!(f, "Communication error: {}", msg),
            Self::Rejected(msg) => write!(f, "Rejected by remote host: {}", msg),
            Self::Fault(msg) => write!(f, "Remote fault: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// The low-level contract every host serves on its base endpoint.
#[async_trait::async_trait]
pub trait BaseContract: Send + Sync + 'static {
    /// Liveness probe. Healthy peers answer `Ok(true)`.
    async fn ping(&self) -> Result<bool>;
}

/// Which of the two endpoints of a hosted service a channel talks to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Application calls.
    Client,
    /// Ping and session establishment.
    Base,
}

/// Out-of-band headers identifying the caller's own listening port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderName {
    BaseServicePort,
    ClientServicePort,
}

impl HeaderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BaseServicePort => "BaseServicePort",
            Self::ClientServicePort => "ClientServicePort",
        }
    }

    /// The header a channel to the given endpoint carries.
    pub fn for_endpoint(kind: EndpointKind) -> Self {
        match kind {
            EndpointKind::Base => Self::BaseServicePort,
            EndpointKind::Client => Self::ClientServicePort,
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header values attached to every call made on a channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    values: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: HeaderName, value: impl Into<String>) {
        self.values.insert(name.as_str().to_string(), value.into());
    }

    /// Raw lookup, for headers this crate does not define.
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns the header value, treating an empty value as absent.
    pub fn get(&self, name: HeaderName) -> Option<&str> {
        self.get_raw(name.as_str()).filter(|v| !v.is_empty())
    }
}

/// Address of one endpoint of a hosted service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    pub host: HostAddress,
    pub service: String,
    pub kind: EndpointKind,
}

impl EndpointAddress {
    pub fn new(host: HostAddress, service: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            host,
            service: service.into(),
            kind,
        }
    }

    /// `net.tcp://ip:port/Service` or `net.tcp://ip:port/Service/BaseService`.
    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net.tcp://{}:{}/{}", self.host.ip(), self.host.port(), self.service)?;
        if self.kind == EndpointKind::Base {
            f.write_str("/BaseService")?;
        }
        Ok(())
    }
}

/// Control over the channel an inbound session arrived on.
pub trait ChannelControl: Send + Sync + 'static {
    /// Tears the channel down. Idempotent.
    fn abort(&self);

    fn is_aborted(&self) -> bool;
}

/// Server-side view of one inbound session.
#[derive(Clone)]
pub struct CallContext {
    /// Caller ip, loopback forms already mapped to `localhost`.
    pub remote_ip: String,
    pub headers: MessageHeaders,
    pub session_id: u64,
    pub endpoint: EndpointKind,
    pub channel: Arc<dyn ChannelControl>,
}

impl CallContext {
    pub fn abort(&self) {
        self.channel.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.channel.is_aborted()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("remote_ip", &self.remote_ip)
            .field("headers", &self.headers)
            .field("session_id", &self.session_id)
            .field("endpoint", &self.endpoint)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Receives inbound sessions on behalf of a listening host.
#[async_trait::async_trait]
pub trait Dispatcher<C: ?Sized + Send + Sync + 'static>: Send + Sync + 'static {
    /// Binds a session opened on the client endpoint and returns the service
    /// instance that will serve it.
    async fn accept_service(&self, context: CallContext) -> Result<Arc<C>>;

    /// Binds a session opened on the base endpoint.
    async fn accept_base(&self, context: CallContext) -> Result<Arc<dyn BaseContract>>;
}

/// Outbound half of a transport.
#[async_trait::async_trait]
pub trait Connector<C: ?Sized + Send + Sync + 'static>: Send + Sync + 'static {
    async fn open_service(&self, endpoint: &EndpointAddress, headers: &MessageHeaders) -> Result<Arc<C>>;

    async fn open_base(&self, endpoint: &EndpointAddress, headers: &MessageHeaders) -> Result<Arc<dyn BaseContract>>;
}

/// Where a host listens: its own address plus the service name shared by both
/// endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddress {
    pub host: HostAddress,
    pub service: String,
}

impl ListenAddress {
    pub fn endpoint(&self, kind: EndpointKind) -> EndpointAddress {
        EndpointAddress::new(self.host.clone(), self.service.clone(), kind)
    }
}

/// A running listener. Dropping it does not stop it; call `close`.
pub trait Listener: Send + Sync + 'static {
    fn local_address(&self) -> &ListenAddress;

    fn close(&self);
}

/// Inbound half of a transport.
#[async_trait::async_trait]
pub trait Acceptor<C: ?Sized + Send + Sync + 'static>: Send + Sync + 'static {
    async fn listen(&self, address: ListenAddress, dispatcher: Arc<dyn Dispatcher<C>>) -> Result<Box<dyn Listener>>;
}

/// A transport able to both open channels and listen.
pub trait Transport<C: ?Sized + Send + Sync + 'static>: Connector<C> + Acceptor<C> {}

impl<C: ?Sized + Send + Sync + 'static, T> Transport<C> for T where T: Connector<C> + Acceptor<C> {}
