//! # Connections
//!
//! A `Connection` is the registry's record of one peer: the channel we opened
//! to it, the latest session it opened to us, the policy for its application
//! calls and whatever the application attached to it. The types here that end
//! in `Info`, or wrap one, are detached snapshots handed out to callers.

use std::fmt;
use std::sync::Arc;

use crate::address::HostAddress;
use crate::events::SubscriptionId;
use crate::outgoing::OutgoingChannel;
use crate::transport::CallContext;

/// Whether application calls from a peer may proceed.
///
/// Base traffic (pings, session establishment) is always allowed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum IncomingOperationStatus {
    #[default]
    Deny,
    Allow,
}

impl fmt::Display for IncomingOperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deny => f.write_str("Deny"),
            Self::Allow => f.write_str("Allow"),
        }
    }
}

/// Registry entry for one remote host. Owned by the registry map.
pub(crate) struct Connection<C: ?Sized + Send + Sync + 'static, D> {
    pub(crate) remote: HostAddress,
    pub(crate) outgoing: Option<Arc<OutgoingChannel<C>>>,
    /// The registry's subscription to `outgoing`'s events.
    pub(crate) subscription: Option<SubscriptionId>,
    pub(crate) incoming: Option<CallContext>,
    pub(crate) status: IncomingOperationStatus,
    pub(crate) data: Option<Arc<D>>,
}

impl<C: ?Sized + Send + Sync + 'static, D> Connection<C, D> {
    pub(crate) fn outbound(remote: HostAddress, status: IncomingOperationStatus, data: Option<Arc<D>>) -> Self {
        Self {
            remote,
            outgoing: None,
            subscription: None,
            incoming: None,
            status,
            data,
        }
    }

    pub(crate) fn inbound(remote: HostAddress, context: CallContext) -> Self {
        Self {
            remote,
            outgoing: None,
            subscription: None,
            incoming: Some(context),
            status: IncomingOperationStatus::default(),
            data: None,
        }
    }

    pub(crate) fn attach_outgoing(&mut self, outgoing: Arc<OutgoingChannel<C>>, subscription: SubscriptionId) {
        self.outgoing = Some(outgoing);
        self.subscription = Some(subscription);
    }

    pub(crate) fn info(&self) -> ConnectionInfo<D> {
        ConnectionInfo {
            address: self.remote.clone(),
            data: self.data.clone(),
            status: self.status,
            has_outgoing: self.outgoing.is_some(),
            has_incoming: self.incoming.is_some(),
        }
    }

    /// Detaches from and closes the outgoing channel, aborts the inbound one
    /// and releases data.
    pub(crate) fn dispose(&mut self) {
        if let Some(outgoing) = self.outgoing.take() {
            if let Some(id) = self.subscription.take() {
                outgoing.unsubscribe(id);
            }
            outgoing.dispose();
        }
        if let Some(incoming) = self.incoming.take() {
            incoming.abort();
        }
        self.data = None;
    }
}

impl<C: ?Sized + Send + Sync + 'static, D> Drop for Connection<C, D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Detached view of a connection.
pub struct ConnectionInfo<D> {
    pub address: HostAddress,
    /// Shared with the registry entry. Removing the connection drops the
    /// registry's reference only; `D` itself is dropped with the last
    /// snapshot still holding it.
    pub data: Option<Arc<D>>,
    pub status: IncomingOperationStatus,
    pub has_outgoing: bool,
    pub has_incoming: bool,
}

impl<D> Clone for ConnectionInfo<D> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            data: self.data.clone(),
            status: self.status,
            has_outgoing: self.has_outgoing,
            has_incoming: self.has_incoming,
        }
    }
}

impl<D> fmt::Debug for ConnectionInfo<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("address", &self.address)
            .field("has_data", &self.data.is_some())
            .field("status", &self.status)
            .field("has_outgoing", &self.has_outgoing)
            .field("has_incoming", &self.has_incoming)
            .finish()
    }
}

/// What a broadcast action receives: the peer and the channel to call it on.
pub struct OutgoingConnection<C: ?Sized + Send + Sync + 'static, D> {
    pub info: ConnectionInfo<D>,
    pub outgoing: Arc<OutgoingChannel<C>>,
}

impl<C: ?Sized + Send + Sync + 'static, D> OutgoingConnection<C, D> {
    pub fn address(&self) -> &HostAddress {
        &self.info.address
    }

    pub fn data(&self) -> Option<&Arc<D>> {
        self.info.data.as_ref()
    }
}

impl<C: ?Sized + Send + Sync + 'static, D> Clone for OutgoingConnection<C, D> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            outgoing: self.outgoing.clone(),
        }
    }
}

/// Argument of the new-incoming-connection handlers.
///
/// Handlers run in registration order on a background task; each may adjust
/// the decision. When all have run, the registry applies it.
pub struct NewIncomingConnection<D> {
    pub connection: ConnectionInfo<D>,
    /// Policy for application calls from this peer.
    pub incoming_status: IncomingOperationStatus,
    /// Open a return channel to this peer.
    pub create_connection_to_remote_host: bool,
    data: Option<D>,
}

impl<D> NewIncomingConnection<D> {
    pub(crate) fn new(connection: ConnectionInfo<D>) -> Self {
        let incoming_status = connection.status;
        Self {
            connection,
            incoming_status,
            create_connection_to_remote_host: false,
            data: None,
        }
    }

    /// Attaches application data to the connection.
    pub fn set_data(&mut self, data: D) {
        self.data = Some(data);
    }

    pub(crate) fn take_data(&mut self) -> Option<D> {
        self.data.take()
    }
}
