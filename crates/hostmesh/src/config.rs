//! # Configuration
//!
//! Timing and retry knobs. The defaults are the values the protocol was tuned
//! with; they are starting points, not guarantees.

use std::sync::Arc;
use std::time::Duration;

use crate::log::Log;
use crate::log::default_log;

/// Service name used when the host is not given one.
pub const DEFAULT_SERVICE_NAME: &str = "HostMeshService";

/// Settings for one outgoing channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Delay between two liveness probes.
    pub ping_interval: Duration,
    /// Base budget of one `call` attempt. See `effective_operation_timeout`.
    pub operation_timeout: Duration,
    /// Attempts made by `call` before giving up.
    pub max_tries: u32,
    /// Upper bound on a single ping, including opening the ping channel.
    pub ping_timeout: Duration,
    /// Upper bound on opening the service channel.
    pub open_timeout: Duration,
    /// Upper bound on one service operation.
    pub send_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(500),
            operation_timeout: Duration::from_millis(15_000),
            max_tries: 4,
            ping_timeout: Duration::from_secs(7),
            open_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(120),
        }
    }
}

impl ChannelSettings {
    /// `operation_timeout` plus two ping intervals, so one missed heartbeat
    /// cycle fits inside an attempt.
    pub fn effective_operation_timeout(&self) -> Duration {
        self.operation_timeout + self.ping_interval * 2
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

/// Settings for the inbound session binder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinderSettings {
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for BinderSettings {
    fn default() -> Self {
        Self {
            poll_attempts: 50,
            poll_interval: Duration::from_millis(30),
        }
    }
}

impl BinderSettings {
    /// Total time a client-header session may wait for its policy.
    pub fn budget(&self) -> Duration {
        self.poll_interval * self.poll_attempts
    }

    pub fn with_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Everything a host needs besides its transport and service factory.
#[derive(Clone)]
pub struct HostConfig {
    /// Port this host listens on, reported to peers in call headers.
    pub port: String,
    /// Ip this host listens on.
    pub ip: String,
    pub service_name: String,
    pub channel: ChannelSettings,
    pub binder: BinderSettings,
    pub log: Arc<dyn Log>,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("port", &self.port)
            .field("ip", &self.ip)
            .field("service_name", &self.service_name)
            .field("channel", &self.channel)
            .field("binder", &self.binder)
            .finish()
    }
}

/// Fluent builder for [`HostConfig`].
pub struct HostBuilder {
    config: HostConfig,
}

impl HostBuilder {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            config: HostConfig {
                port: port.into(),
                ip: crate::address::LOCALHOST.to_string(),
                service_name: DEFAULT_SERVICE_NAME.to_string(),
                channel: ChannelSettings::default(),
                binder: BinderSettings::default(),
                log: default_log(),
            },
        }
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.config.ip = ip.into();
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    pub fn channel(mut self, settings: ChannelSettings) -> Self {
        self.config.channel = settings;
        self
    }

    pub fn binder(mut self, settings: BinderSettings) -> Self {
        self.config.binder = settings;
        self
    }

    pub fn log(mut self, log: Arc<dyn Log>) -> Self {
        self.config.log = log;
        self
    }

    pub fn build(self) -> HostConfig {
        self.config
    }
}
