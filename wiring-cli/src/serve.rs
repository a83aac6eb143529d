//! Serve command for the wiring CLI
//!
//! Starts a node, exports the echo service and keeps running until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::ctrl_c;
use wiring_common::{log_info, Logger};
use wiring_node::WiringNode;

use crate::echo::{EchoService, ECHO_SERVICE};
use crate::options::NodeArgs;

pub struct ServeCommand {
    logger: Arc<Logger>,
}

impl ServeCommand {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }

    pub async fn run(&self, args: &NodeArgs) -> Result<()> {
        let config = args.node_config()?;
        let store = args.store(&config, &self.logger)?;
        let node = WiringNode::start(config, store)
            .await
            .context("Failed to start wiring node")?;

        node.register_receiver(ECHO_SERVICE, EchoService::new(self.logger.clone()))
            .await;
        let base = node.base_url().await?;
        log_info!(self.logger, "Serving {ECHO_SERVICE} at {base}{ECHO_SERVICE}");
        println!("Node {}/{} is running", node.zone(), node.node());
        println!("   {ECHO_SERVICE}: {base}{ECHO_SERVICE}");
        println!("Press Ctrl+C to stop");

        ctrl_c()
            .await
            .context("Failed to create shutdown signal handler")?;
        log_info!(self.logger, "Shutdown signal received - stopping node...");
        node.stop().await.context("Failed to stop wiring node")?;
        println!("Node stopped");
        Ok(())
    }
}
