use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use wiring_common::{log_info, Logger};
use wiring_node::{Message, WiringReceiver};

/// Service id the CLI exports its echo receiver under
pub const ECHO_SERVICE: &str = "echoService";

/// Replies `echo: <message>` and logs who asked
pub struct EchoService {
    logger: Arc<Logger>,
}

impl EchoService {
    pub fn new(logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self { logger })
    }
}

#[async_trait]
impl WiringReceiver for EchoService {
    async fn message_received(&self, message: Message) -> Result<Option<String>> {
        log_info!(
            self.logger,
            "{} from {}/{} ({})",
            message.service_id,
            message.from_zone,
            message.from_node,
            message.from_endpoint_name
        );
        Ok(Some(format!("echo: {}", message.message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiring_common::Component;

    #[test]
    fn test_echo_reply() {
        let echo = EchoService::new(Arc::new(Logger::new_root(Component::CLI, "test")));
        let reply =
            tokio_test::block_on(echo.message_received(Message::new("cli", "ping"))).unwrap();
        assert_eq!(reply.as_deref(), Some("echo: ping"));
    }
}
