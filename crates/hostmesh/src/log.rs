//! # Logging port
//!
//! Components never reach for a global logger. Each one is handed an
//! `Arc<dyn Log>` when it is built and tags its lines with a component name.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("Info"),
            Self::Warn => f.write_str("Warn"),
            Self::Error => f.write_str("Error"),
        }
    }
}

/// Sink for diagnostic messages.
pub trait Log: Send + Sync + 'static {
    fn log(&self, level: Level, component: &str, message: &str);

    fn info(&self, component: &str, message: &str) {
        self.log(Level::Info, component, message);
    }

    fn warn(&self, component: &str, message: &str) {
        self.log(Level::Warn, component, message);
    }

    fn error(&self, component: &str, message: &str) {
        self.log(Level::Error, component, message);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLog;

impl Log for NoopLog {
    fn log(&self, _level: Level, _component: &str, _message: &str) {}
}

/// Forwards to `tracing`. Silent until the process installs a subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLog;

impl Log for TracingLog {
    fn log(&self, level: Level, component: &str, message: &str) {
        match level {
            Level::Info => tracing::info!(component, "{}", message),
            Level::Warn => tracing::warn!(component, "{}", message),
            Level::Error => tracing::error!(component, "{}", message),
        }
    }
}

/// Captures log lines in memory for inspection.
#[derive(Clone, Debug, Default)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all captured lines, formatted as `[Level] component: message`.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Lines at `level` whose text contains `needle`.
    pub fn matching(&self, level: Level, needle: &str) -> Vec<String> {
        let prefix = format!("[{}]", level);
        self.lines
            .lock()
            .iter()
            .filter(|l| l.starts_with(&prefix) && l.contains(needle))
            .cloned()
            .collect()
    }
}

impl Log for MemoryLog {
    fn log(&self, level: Level, component: &str, message: &str) {
        self.lines.lock().push(format!("[{}] {}: {}", level, component, message));
    }
}

/// The default port handed to components that were not given one.
pub fn default_log() -> Arc<dyn Log> {
    Arc::new(TracingLog)
}
