// Logging utilities for the wiring crates
//
// This module provides:
// - Component-based structured logging
// - Node ID tracking through logger inheritance
// - Endpoint path tracing for per-endpoint log lines
// - A small env_logger bootstrap (`LoggingConfig`)

use log::{debug, error, info, warn, LevelFilter};
use std::fmt::{self, Arguments, Display, Formatter};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Node,
    Admin,
    Discovery,
    Store,
    EventBus,
    Transport,
    Topology,
    Config,
    CLI,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Node => "Node",
            Component::Admin => "Admin",
            Component::Discovery => "Discovery",
            Component::Store => "Store",
            Component::EventBus => "EventBus",
            Component::Transport => "Transport",
            Component::Topology => "Topology",
            Component::Config => "Config",
            Component::CLI => "CLI",
            Component::Custom(name) => name,
        }
    }
}

// Display helpers so the `*_args` variants never build a prefix String
struct ComponentPrefixDisplay {
    parent: Option<Component>,
    component: Component,
}

impl Display for ComponentPrefixDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != Component::Node => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => write!(f, "{}", self.component.as_str()),
        }
    }
}

struct MaybeEndpointDisplay<'a>(Option<&'a str>);

impl Display for MaybeEndpointDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(path) = self.0 {
            write!(f, "|endpoint={path}")
        } else {
            Ok(())
        }
    }
}

/// A helper for creating component-specific loggers with node ID tracking
#[derive(Clone, Debug)]
pub struct Logger {
    component: Component,
    /// Node ID (`zone/node`) for distributed tracing
    node_id: String,
    parent_component: Option<Component>,
    /// Endpoint path, set for loggers owned by a single endpoint
    endpoint_path: Option<String>,
}

impl Logger {
    /// Create a new root logger for a specific component and node ID
    pub fn new_root(component: Component, node_id: &str) -> Self {
        Self {
            component,
            node_id: node_id.to_string(),
            parent_component: None,
            endpoint_path: None,
        }
    }

    /// Create a child logger with the same node ID but different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            node_id: self.node_id.clone(),
            parent_component: Some(self.component),
            endpoint_path: self.endpoint_path.clone(),
        }
    }

    /// Create a logger that tags every line with an endpoint path
    pub fn with_endpoint_path(&self, path: impl Into<String>) -> Self {
        Self {
            component: self.component,
            node_id: self.node_id.clone(),
            parent_component: self.parent_component,
            endpoint_path: Some(path.into()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn endpoint_path(&self) -> Option<&str> {
        self.endpoint_path.as_deref()
    }

    fn is_root(&self) -> bool {
        self.component == Component::Node && self.parent_component.is_none()
    }

    fn prefix(&self) -> ComponentPrefixDisplay {
        ComponentPrefixDisplay {
            parent: self.parent_component,
            component: self.component,
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            self.debug_args(format_args!("{}", message.into()));
        }
    }

    /// Log a debug message using fmt::Arguments (avoids allocating message String)
    pub fn debug_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Debug) {
            if self.is_root() {
                debug!("[{}] {}", self.node_id, args);
            } else {
                debug!(
                    "[{}][{}{}] {}",
                    self.node_id,
                    self.prefix(),
                    MaybeEndpointDisplay(self.endpoint_path()),
                    args
                );
            }
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Info) {
            self.info_args(format_args!("{}", message.into()));
        }
    }

    /// Log an info message using fmt::Arguments
    pub fn info_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Info) {
            if self.is_root() {
                info!("[{}] {}", self.node_id, args);
            } else {
                info!(
                    "[{}][{}{}] {}",
                    self.node_id,
                    self.prefix(),
                    MaybeEndpointDisplay(self.endpoint_path()),
                    args
                );
            }
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Warn) {
            self.warn_args(format_args!("{}", message.into()));
        }
    }

    /// Log a warning using fmt::Arguments
    pub fn warn_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Warn) {
            if self.is_root() {
                warn!("[{}] {}", self.node_id, args);
            } else {
                warn!(
                    "[{}][{}{}] {}",
                    self.node_id,
                    self.prefix(),
                    MaybeEndpointDisplay(self.endpoint_path()),
                    args
                );
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Error) {
            self.error_args(format_args!("{}", message.into()));
        }
    }

    /// Log an error using fmt::Arguments
    pub fn error_args(&self, args: Arguments) {
        if log::log_enabled!(log::Level::Error) {
            if self.is_root() {
                error!("[{}] {}", self.node_id, args);
            } else {
                error!(
                    "[{}][{}{}] {}",
                    self.node_id,
                    self.prefix(),
                    MaybeEndpointDisplay(self.endpoint_path()),
                    args
                );
            }
        }
    }
}

/// Log levels accepted by [`LoggingConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Process-wide logging setup.
///
/// `RUST_LOG`, when set, wins over the configured levels. Applying twice is
/// harmless: the second `apply` leaves the installed logger in place.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    default_level: LogLevel,
    module_levels: Vec<(String, LogLevel)>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self {
            default_level: LogLevel::Info,
            module_levels: Vec::new(),
        }
    }

    pub fn default_info() -> Self {
        Self::new()
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Override the level of one module path, e.g. `hyper` or `reqwest`
    pub fn with_module_level(mut self, module: impl Into<String>, level: LogLevel) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }

    pub fn default_level(&self) -> LogLevel {
        self.default_level
    }

    /// Install env_logger with this configuration
    pub fn apply(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.default_level.to_level_filter());
        for (module, level) in &self.module_levels {
            builder.filter_module(module, level.to_level_filter());
        }
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        // Another logger (or a previous apply) may already be installed.
        let _ = builder.is_test(cfg!(test)).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_prefix_skips_node_parent() {
        let root = Logger::new_root(Component::Node, "z1/a");
        let discovery = root.with_component(Component::Discovery);
        let store = discovery.with_component(Component::Store);

        assert_eq!(format!("{}", discovery.prefix()), "Discovery");
        assert_eq!(format!("{}", store.prefix()), "Discovery.Store");
        assert_eq!(store.node_id(), "z1/a");
    }

    #[test]
    fn test_endpoint_path_is_inherited() {
        let logger = Logger::new_root(Component::Admin, "z1/a").with_endpoint_path("echoService");
        let child = logger.with_component(Component::Transport);
        assert_eq!(child.endpoint_path(), Some("echoService"));
        assert_eq!(
            format!("{}", MaybeEndpointDisplay(child.endpoint_path())),
            "|endpoint=echoService"
        );
    }

    #[test]
    fn test_apply_twice_is_harmless() {
        let config = LoggingConfig::new()
            .with_default_level(LogLevel::Debug)
            .with_module_level("hyper", LogLevel::Warn);
        config.apply();
        config.apply();
        assert_eq!(config.default_level(), LogLevel::Debug);
    }
}
