//! # Session Binder
//!
//! Runs once per inbound session and ties it to the caller's registry entry.
//!
//! ## Protocol
//!
//! The caller reports its own listening port in one of two headers. Base
//! sessions (pings, session establishment) carry `BaseServicePort`; client
//! sessions (application calls) carry `ClientServicePort`. Together with the
//! caller ip this gives the address the entry is keyed by.
//!
//! - A base session is never held up by policy. It refreshes the entry if
//!   there is one and otherwise inserts it and announces the new peer.
//! - A client session is only accepted once its entry exists with policy
//!   `Allow`. It waits for that up to the poll budget, then is rejected.
//!
//! Waiting happens without the registry lock. Each tick sleeps one poll
//! interval or wakes early when the registry changes.

use std::sync::Arc;

use tokio::time::Instant;

use crate::address::HostAddress;
use crate::address::normalize_ip;
use crate::config::BinderSettings;
use crate::connection::IncomingOperationStatus;
use crate::fault::ServiceError;
use crate::registry::ConnectionRegistry;
use crate::registry::Inserted;
use crate::transport::CallContext;
use crate::transport::HeaderName;
use crate::transport::TransportError;

const COMPONENT: &str = "binder";

/// An inbound session that passed the binder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundSession {
    /// The caller's registry key.
    pub address: HostAddress,
    /// Which header identified the caller.
    pub header: HeaderName,
    /// Whether this session created the registry entry.
    pub is_new: bool,
}

pub struct SessionBinder<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> {
    registry: Arc<ConnectionRegistry<C, D>>,
    settings: BinderSettings,
}

impl<C: ?Sized + Send + Sync + 'static, D: Send + Sync + 'static> SessionBinder<C, D> {
    pub fn new(registry: Arc<ConnectionRegistry<C, D>>, settings: BinderSettings) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &BinderSettings {
        &self.settings
    }

    /// Binds `context` to its registry entry.
    ///
    /// A session without either port header is aborted.
    pub async fn bind(&self, context: &CallContext) -> Result<BoundSession, ServiceError> {
        let Some((header, port)) = reported_port(context) else {
            context.abort();
            return Err(ServiceError::MissingServicePort {
                from: context.remote_ip.clone(),
            });
        };
        if !self.registry.is_running() {
            context.abort();
            return Err(ServiceError::Transport(TransportError::Aborted));
        }

        let address = HostAddress::new(normalize_ip(&context.remote_ip), port);
        let is_base = header == HeaderName::BaseServicePort;
        let deadline = Instant::now() + self.settings.budget();

        loop {
            // Registered before the lookup so a change in between still wakes us.
            let changed = self.registry.changed().notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.registry.refresh_incoming(&address, context) {
                Some(status) if is_base || status == IncomingOperationStatus::Allow => {
                    return Ok(BoundSession {
                        address,
                        header,
                        is_new: false,
                    });
                }
                None if is_base => break,
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ServiceError::BlockingIncomingOperation { from: address });
            }
            let tick = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }

        match self.registry.insert_incoming(&address, context) {
            Inserted::New(info) => {
                self.registry.log().info(
                    COMPONENT,
                    &format!("New incoming connection from {}, connections: {}", address, self.registry.len()),
                );
                self.registry.notify_new_incoming(info);
                Ok(BoundSession {
                    address,
                    header,
                    is_new: true,
                })
            }
            Inserted::Existing(_) => Ok(BoundSession {
                address,
                header,
                is_new: false,
            }),
        }
    }
}

/// The caller's listening port, preferring the base header.
fn reported_port(context: &CallContext) -> Option<(HeaderName, String)> {
    [HeaderName::BaseServicePort, HeaderName::ClientServicePort]
        .into_iter()
        .find_map(|name| context.headers.get(name).map(|port| (name, port.to_string())))
}
