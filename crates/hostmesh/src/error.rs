//! Host lifecycle errors.

use std::fmt;

use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transport refused to start listening.
    Listen(TransportError),
    /// The host has been shut down.
    NotRunning,
    /// An address with an empty ip or port was supplied.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen(e) => write!(f, "Listen error: {}", e),
            Self::NotRunning => write!(f, "Host is not running"),
            Self::InvalidAddress(addr) => write!(f, "Invalid address: '{}'", addr),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Listen(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
