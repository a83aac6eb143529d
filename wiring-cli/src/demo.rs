//! Demo command for the wiring CLI
//!
//! Runs two nodes in one process over a shared in-memory directory. The first
//! exports the echo service, the second discovers it and sends a message.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use wiring_common::{log_info, Logger};
use wiring_node::config::{DiscoveryConfig, HttpAdminConfig};
use wiring_node::{MemoryStore, Message, NodeConfig, WiringNode, WiringSender};

use crate::echo::{EchoService, ECHO_SERVICE};

const DEMO_ZONE: &str = "demo";
const DEMO_ROOT: &str = "/wiring-demo";

pub struct DemoCommand {
    logger: Arc<Logger>,
}

fn demo_config(node: &str) -> NodeConfig {
    NodeConfig::new(DEMO_ZONE, node)
        .with_admin_config(
            HttpAdminConfig::new(DEMO_ZONE, node)
                .with_host("127.0.0.1")
                .with_port(0),
        )
        .with_discovery_config(DiscoveryConfig::new(DEMO_ZONE, node).with_root_path(DEMO_ROOT))
}

impl DemoCommand {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }

    /// Run the exchange and return the reply the exporting node sent back
    pub async fn run(&self, message: &str, wait: Duration) -> Result<Option<String>> {
        let store = Arc::new(MemoryStore::new());
        let server = WiringNode::start(demo_config("server"), store.clone())
            .await
            .context("Failed to start demo server node")?;
        let client = match WiringNode::start(demo_config("client"), store).await {
            Ok(client) => client,
            Err(e) => {
                server.stop().await?;
                return Err(e.context("Failed to start demo client node"));
            }
        };

        server
            .register_receiver(ECHO_SERVICE, EchoService::new(self.logger.clone()))
            .await;
        log_info!(self.logger, "server exported {ECHO_SERVICE} at {}", server.base_url().await?);

        let result = async {
            let sender = client
                .wait_for_sender(DEMO_ZONE, "server", ECHO_SERVICE, wait)
                .await?;
            let reply = sender
                .send_message(Message::new("demo", message))
                .await
                .context("Demo exchange failed")?;
            Ok::<_, anyhow::Error>(reply)
        }
        .await;

        client.stop().await?;
        server.stop().await?;
        result
    }
}
