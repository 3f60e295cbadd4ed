//! Structured logging utilities for Hoard components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use hoard_config::{log_network_info, log_storage_warn};
//!
//! log_network_info!("Connection accepted", connection_id = 7);
//! log_storage_warn!("Blob missing", size = 1024);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DAEMON: &'static str = "DAEMON";
    pub const STORAGE: &'static str = "STORAGE";
    pub const NETWORK: &'static str = "NETWORK";
    pub const WORK: &'static str = "WORK";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

// === STORAGE logging macros ===

#[macro_export]
macro_rules! log_storage_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "STORAGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_storage_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "STORAGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_storage_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "STORAGE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_storage_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "STORAGE", $($key = $value,)* $msg)
    };
}

// === NETWORK logging macros ===

#[macro_export]
macro_rules! log_network_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "NETWORK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_network_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "NETWORK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_network_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "NETWORK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_network_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "NETWORK", $($key = $value,)* $msg)
    };
}

// === WORK logging macros ===

#[macro_export]
macro_rules! log_work_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "WORK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_work_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "WORK", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::DAEMON, "DAEMON");
        assert_eq!(Component::STORAGE, "STORAGE");
        assert_eq!(Component::NETWORK, "NETWORK");
    }

    #[test]
    fn test_level_filters() {
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }

    #[test]
    fn test_macros_expand() {
        let key = "abc";
        log_storage_debug!("Storage macro", key = key);
        log_network_debug!("Network macro", connection_id = 3);
        log_work_debug!("Work macro");
    }
}
