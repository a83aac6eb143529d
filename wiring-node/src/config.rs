// Configuration for the HTTP admin and the directory discovery
//
// Both configurations can be built in code with `with_*` setters or parsed
// from a flat key/value map. Parsing validates everything up front so a bad
// update never reaches live components.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;
use wiring_common::LoggingConfig;

pub const PROP_HOST: &str = "host";
pub const PROP_PORT: &str = "port";
pub const PROP_PATH: &str = "path";
pub const PROP_CONNECT_TIMEOUT: &str = "connecttimeout";
pub const PROP_READ_TIMEOUT: &str = "readtimeout";
pub const PROP_ZONE: &str = "zone";
pub const PROP_NODE: &str = "node";
pub const PROP_CONNECT_URL: &str = "connecturl";
pub const PROP_ROOT_PATH: &str = "rootpath";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PATH: &str = "/org.inaetics.wiring.admin.http/";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(60000);
pub const DEFAULT_ZONE: &str = "default";
pub const DEFAULT_CONNECT_URL: &str = "http://localhost:2379";
pub const DEFAULT_ROOT_PATH: &str = "/inaetics/wiring";
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_RESCAN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_RESCAN_BACKOFF: Duration = Duration::from_secs(30);

/// Republishing runs this much earlier than the TTL would expire
const REFRESH_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration property '{0}'")]
    Missing(&'static str),

    #[error("invalid value '{value}' for '{key}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(key: &'static str, value: impl Into<String>, reason: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.into(),
        reason: reason.to_string(),
    }
}

fn non_empty<'a>(props: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    props
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_millis(
    props: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    non_empty(props, key)
        .map(|v| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| invalid(key, v, e))
        })
        .transpose()
}

/// Ensure a leading and a trailing slash
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Settings of the HTTP admin: where it listens and how it calls peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAdminConfig {
    pub zone: String,
    pub node: String,
    pub host: String,
    /// 0 binds an ephemeral port; the published url uses the bound one
    pub port: u16,
    pub path: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl HttpAdminConfig {
    pub fn new(zone: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            node: node.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// `http://{host}:{port}{path}`
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        self.base_url_with_port(self.port)
    }

    pub fn base_url_with_port(&self, port: u16) -> Result<Url, ConfigError> {
        let raw = format!("http://{}:{}{}", self.host, port, self.path);
        Url::parse(&raw).map_err(|e| invalid(PROP_HOST, raw, e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zone.is_empty() {
            return Err(ConfigError::Missing(PROP_ZONE));
        }
        if self.node.is_empty() {
            return Err(ConfigError::Missing(PROP_NODE));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid(PROP_CONNECT_TIMEOUT, "0", "must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(invalid(PROP_READ_TIMEOUT, "0", "must be positive"));
        }
        self.base_url().map(|_| ())
    }

    /// Parse flat properties; unknown keys are ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let zone = non_empty(props, PROP_ZONE).unwrap_or(DEFAULT_ZONE).to_string();
        let node = non_empty(props, PROP_NODE)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut config = Self::new(zone, node);

        if let Some(host) = non_empty(props, PROP_HOST) {
            config.host = host.to_string();
        }
        if let Some(port) = non_empty(props, PROP_PORT) {
            config.port = port.parse().map_err(|e| invalid(PROP_PORT, port, e))?;
        }
        if let Some(path) = non_empty(props, PROP_PATH) {
            config.path = normalize_path(path);
        }
        if let Some(timeout) = parse_millis(props, PROP_CONNECT_TIMEOUT)? {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(props, PROP_READ_TIMEOUT)? {
            config.read_timeout = timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for HttpAdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HttpAdminConfig: {}/{} http://{}:{}{} connect:{}ms read:{}ms",
            self.zone,
            self.node,
            self.host,
            self.port,
            self.path,
            self.connect_timeout.as_millis(),
            self.read_timeout.as_millis()
        )
    }
}

/// Settings of the directory discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub zone: String,
    pub node: String,
    pub connect_url: String,
    pub root_path: String,
    pub ttl: Duration,
    pub rescan_backoff: Duration,
    pub max_rescan_backoff: Duration,
}

impl DiscoveryConfig {
    pub fn new(zone: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            node: node.into(),
            connect_url: DEFAULT_CONNECT_URL.to_string(),
            root_path: DEFAULT_ROOT_PATH.to_string(),
            ttl: DEFAULT_TTL,
            rescan_backoff: DEFAULT_RESCAN_BACKOFF,
            max_rescan_backoff: MAX_RESCAN_BACKOFF,
        }
    }

    pub fn with_connect_url(mut self, url: impl Into<String>) -> Self {
        self.connect_url = url.into();
        self
    }

    /// Parsed store url
    pub fn store_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.connect_url)
            .map_err(|e| invalid(PROP_CONNECT_URL, self.connect_url.clone(), e))
    }

    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_rescan_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.rescan_backoff = initial;
        self.max_rescan_backoff = max.max(initial);
        self
    }

    /// Period of the republish task: TTL minus a safety margin
    pub fn refresh_interval(&self) -> Duration {
        if self.ttl > REFRESH_MARGIN * 2 {
            self.ttl - REFRESH_MARGIN
        } else {
            self.ttl / 2
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zone.is_empty() {
            return Err(ConfigError::Missing(PROP_ZONE));
        }
        if self.node.is_empty() {
            return Err(ConfigError::Missing(PROP_NODE));
        }
        if self.zone.contains('/') {
            return Err(invalid(PROP_ZONE, self.zone.clone(), "must not contain '/'"));
        }
        if self.node.contains('/') {
            return Err(invalid(PROP_NODE, self.node.clone(), "must not contain '/'"));
        }
        if self.ttl < Duration::from_secs(1) {
            return Err(invalid("ttl", format!("{:?}", self.ttl), "must be at least 1s"));
        }
        self.store_url().map(|_| ())
    }

    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let zone = non_empty(props, PROP_ZONE).ok_or(ConfigError::Missing(PROP_ZONE))?;
        let node = non_empty(props, PROP_NODE).ok_or(ConfigError::Missing(PROP_NODE))?;
        let mut config = Self::new(zone, node);

        if let Some(url) = non_empty(props, PROP_CONNECT_URL) {
            config.connect_url = url.to_string();
        }
        if let Some(root) = non_empty(props, PROP_ROOT_PATH) {
            config.root_path = root.to_string();
        }
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DiscoveryConfig: {}/{} store:{} root:{} ttl:{}s",
            self.zone,
            self.node,
            self.connect_url,
            self.root_path,
            self.ttl.as_secs()
        )
    }
}

/// Everything a [`crate::WiringNode`] needs to start
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub zone: String,
    pub node: String,
    pub admin: HttpAdminConfig,
    pub discovery: DiscoveryConfig,
    pub logging_config: Option<LoggingConfig>,
}

impl NodeConfig {
    pub fn new(zone: impl Into<String>, node: impl Into<String>) -> Self {
        let zone = zone.into();
        let node = node.into();
        Self {
            admin: HttpAdminConfig::new(zone.clone(), node.clone()),
            discovery: DiscoveryConfig::new(zone.clone(), node.clone()),
            zone,
            node,
            logging_config: None,
        }
    }

    /// Use this admin config, keeping the node's zone and node names
    pub fn with_admin_config(mut self, mut config: HttpAdminConfig) -> Self {
        config.zone = self.zone.clone();
        config.node = self.node.clone();
        self.admin = config;
        self
    }

    /// Use this discovery config, keeping the node's zone and node names
    pub fn with_discovery_config(mut self, mut config: DiscoveryConfig) -> Self {
        config.zone = self.zone.clone();
        config.node = self.node.clone();
        self.discovery = config;
        self
    }

    pub fn with_logging_config(mut self, config: LoggingConfig) -> Self {
        self.logging_config = Some(config);
        self
    }

    /// `zone/node`, used as the node id in log lines
    pub fn node_id(&self) -> String {
        format!("{}/{}", self.zone, self.node)
    }

    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let discovery = DiscoveryConfig::from_properties(props)?;
        let admin = HttpAdminConfig::from_properties(props)?;
        Ok(Self::new(discovery.zone.clone(), discovery.node.clone())
            .with_admin_config(admin)
            .with_discovery_config(discovery))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admin.validate()?;
        self.discovery.validate()
    }
}

impl fmt::Display for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeConfig: {} [{}] [{}]",
            self.node_id(),
            self.admin,
            self.discovery
        )
    }
}
