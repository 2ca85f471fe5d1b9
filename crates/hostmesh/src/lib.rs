//! # hostmesh
//!
//! Peer-to-peer session layer. Each process runs one host that both listens
//! and keeps self-healing channels to its peers, with a per-peer policy gate
//! on inbound application calls.

pub mod address;
pub mod binder;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fault;
pub mod host;
pub mod log;
pub mod memory;
pub mod outgoing;
pub mod registry;
pub mod transport;

pub use address::HostAddress;
pub use config::ChannelSettings;
pub use config::HostBuilder;
pub use config::HostConfig;
pub use connection::ConnectionInfo;
pub use connection::IncomingOperationStatus;
pub use connection::NewIncomingConnection;
pub use connection::OutgoingConnection;
pub use host::HostManager;
pub use host::Session;
pub use outgoing::CallResult;
pub use outgoing::OutgoingChannel;
pub use registry::ConnectionRegistry;

#[cfg(test)]
mod tests;
