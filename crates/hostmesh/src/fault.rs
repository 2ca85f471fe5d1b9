//! # Inbound fault boundary
//!
//! Everything that goes wrong while binding or serving an inbound session ends
//! here. Errors are classified, logged at the matching severity and converted
//! into the `TransportError` the caller observes. Nothing is rethrown.

use std::fmt;
use std::sync::Arc;

use crate::address::HostAddress;
use crate::log::Log;
use crate::transport::TransportError;

const COMPONENT: &str = "fault";

/// Failure on the inbound side of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The channel itself failed (timeout, abort, negotiation).
    Transport(TransportError),
    /// A client-endpoint session from a peer that is not allowed in.
    BlockingIncomingOperation { from: HostAddress },
    /// The caller sent neither port header.
    MissingServicePort { from: String },
    /// Anything else, including service construction failures.
    Internal(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::BlockingIncomingOperation { from } => write!(
                f,
                "IncomingOperation is NotAllow, FromIp: {}, FromPort: {}",
                from.ip(),
                from.port()
            ),
            Self::MissingServicePort { from } => {
                write!(f, "No service port header from {}", from)
            }
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<TransportError> for ServiceError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", e))
    }
}

impl ServiceError {
    /// What the caller sees on its side of the channel.
    pub fn to_transport(&self) -> TransportError {
        match self {
            Self::Transport(e) => e.clone(),
            Self::BlockingIncomingOperation { .. } => TransportError::Rejected(self.to_string()),
            Self::MissingServicePort { .. } => TransportError::Aborted,
            Self::Internal(msg) => TransportError::Fault(msg.clone()),
        }
    }
}

/// How the boundary reacts to a classified error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// Routine channel churn.
    Ignore,
    /// Expected and recurring.
    Warn,
    /// Unexpected.
    Error,
}

pub fn classify(error: &ServiceError) -> FaultAction {
    match error {
        ServiceError::Transport(
            TransportError::Timeout
            | TransportError::Aborted
            | TransportError::ConnectionLost(_)
            | TransportError::SecurityNegotiation(_)
            | TransportError::Communication(_),
        ) => FaultAction::Ignore,
        ServiceError::BlockingIncomingOperation { .. } => FaultAction::Warn,
        _ => FaultAction::Error,
    }
}

/// Logs inbound errors according to [`classify`].
#[derive(Clone)]
pub struct ServiceErrorHandler {
    log: Arc<dyn Log>,
}

impl ServiceErrorHandler {
    pub fn new(log: Arc<dyn Log>) -> Self {
        Self { log }
    }

    /// Records `error`. Always returns `false`: the boundary never asks the
    /// transport to convert the error into a fault of its own.
    pub fn handle_error(&self, error: &ServiceError) -> bool {
        match classify(error) {
            FaultAction::Ignore => {}
            FaultAction::Warn => self.log.warn(COMPONENT, &error.to_string()),
            FaultAction::Error => self.log.error(COMPONENT, &error.to_string()),
        }
        false
    }

    /// Logs `error` and converts it for the caller.
    pub fn reject(&self, error: ServiceError) -> TransportError {
        self.handle_error(&error);
        error.to_transport()
    }
}

impl fmt::Debug for ServiceErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceErrorHandler").finish_non_exhaustive()
    }
}
