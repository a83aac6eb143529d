//! Node options shared by the `serve` and `send` commands

use anyhow::{Context, Result};
use clap::Args;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiring_common::{hmap, log_warn, Logger};
use wiring_node::config::{
    DEFAULT_PATH, DEFAULT_ROOT_PATH, DEFAULT_ZONE, PROP_CONNECT_URL, PROP_HOST, PROP_NODE,
    PROP_PATH, PROP_PORT, PROP_ROOT_PATH, PROP_ZONE,
};
use wiring_node::{DirectoryStore, EtcdStore, MemoryStore, NodeConfig};

const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Zone this node belongs to
    #[arg(long, default_value = DEFAULT_ZONE)]
    pub zone: String,

    /// Node name, unique within the zone
    #[arg(long)]
    pub node: String,

    /// Interface the HTTP admin binds to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// HTTP admin port; 0 picks a free one
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Base path of exported endpoints
    #[arg(long, default_value = DEFAULT_PATH)]
    pub path: String,

    /// etcd url; without it the node uses a private in-memory directory
    #[arg(long)]
    pub etcd: Option<Url>,

    /// Directory root all nodes of a deployment share
    #[arg(long, default_value = DEFAULT_ROOT_PATH)]
    pub root: String,
}

impl NodeArgs {
    pub fn properties(&self) -> HashMap<String, String> {
        let mut props = hmap!(
            PROP_ZONE => self.zone.clone(),
            PROP_NODE => self.node.clone(),
            PROP_HOST => self.host.clone(),
            PROP_PORT => self.port.to_string(),
            PROP_PATH => self.path.clone(),
            PROP_ROOT_PATH => self.root.clone(),
        );
        if let Some(url) = &self.etcd {
            props.insert(PROP_CONNECT_URL.to_string(), url.to_string());
        }
        props
    }

    pub fn node_config(&self) -> Result<NodeConfig> {
        NodeConfig::from_properties(&self.properties()).context("Invalid node options")
    }

    /// The etcd store when a url was given, an in-memory one otherwise
    pub fn store(
        &self,
        config: &NodeConfig,
        logger: &Arc<Logger>,
    ) -> Result<Arc<dyn DirectoryStore>> {
        if self.etcd.is_none() {
            log_warn!(logger, "No --etcd given; endpoints are only visible inside this process");
            return Ok(Arc::new(MemoryStore::new()));
        }
        let url = config.discovery.store_url()?;
        let store = EtcdStore::new(&url, STORE_REQUEST_TIMEOUT, logger.clone())
            .with_context(|| format!("Failed to set up etcd client for {url}"))?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        node: NodeArgs,
    }

    #[test]
    fn test_defaults_produce_valid_config() {
        let args = Wrapper::parse_from(["wiring", "--node", "a"]).node;
        let config = args.node_config().unwrap();
        assert_eq!(config.zone, DEFAULT_ZONE);
        assert_eq!(config.node, "a");
        assert_eq!(config.admin.host, "127.0.0.1");
        assert_eq!(config.admin.path, DEFAULT_PATH);
        assert_eq!(config.discovery.root_path, DEFAULT_ROOT_PATH);
    }

    #[test]
    fn test_etcd_url_reaches_discovery() {
        let args = Wrapper::parse_from([
            "wiring",
            "--node",
            "a",
            "--zone",
            "z1",
            "--etcd",
            "http://etcd.local:2379",
            "--path",
            "w",
        ])
        .node;
        let config = args.node_config().unwrap();
        assert_eq!(config.discovery.connect_url, "http://etcd.local:2379/");
        assert_eq!(config.admin.path, "/w/");
        assert_eq!(config.admin.zone, "z1");
    }
}
