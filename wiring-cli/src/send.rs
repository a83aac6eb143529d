//! Send command for the wiring CLI
//!
//! Joins the directory as a node without exports, waits until the target
//! endpoint is imported and sends one message to it.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use wiring_common::{log_info, Logger};
use wiring_node::{Message, WiringNode, WiringSender};

use crate::options::NodeArgs;

pub struct SendCommand {
    logger: Arc<Logger>,
}

/// Where a message goes and what it says
#[derive(Debug, Clone)]
pub struct SendTarget {
    pub zone: String,
    pub node: String,
    pub service: String,
    pub message: String,
    pub wait: Duration,
}

impl SendCommand {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }

    /// Deliver the message and return the reply, if the endpoint sent one
    pub async fn run(&self, args: &NodeArgs, target: &SendTarget) -> Result<Option<String>> {
        let config = args.node_config()?;
        let store = args.store(&config, &self.logger)?;
        let node = WiringNode::start(config, store)
            .await
            .context("Failed to start wiring node")?;

        let result = self.deliver(&node, target).await;
        node.stop().await.context("Failed to stop wiring node")?;
        result
    }

    async fn deliver(&self, node: &WiringNode, target: &SendTarget) -> Result<Option<String>> {
        let sender = node
            .wait_for_sender(&target.zone, &target.node, &target.service, target.wait)
            .await?;
        log_info!(
            self.logger,
            "Sending to {}/{}/{}",
            target.zone,
            target.node,
            target.service
        );
        let reply = sender
            .send_message(Message::new("cli", target.message.clone()))
            .await
            .with_context(|| format!("Sending to {} failed", target.service))?;
        Ok(reply)
    }
}
