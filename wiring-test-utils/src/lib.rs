// Test utilities for wiring crates
//
// Fixtures shared by the integration tests: node configurations on ephemeral
// ports, descriptor builders, a recording event listener and an echo receiver.
// Nothing in here is meant for production builds.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use url::Url;
use uuid::Uuid;
use wiring_common::{LogLevel, LoggingConfig};
use wiring_node::config::{DiscoveryConfig, HttpAdminConfig, NodeConfig};
use wiring_node::{EndpointId, EventListener, Message, NodeDescriptor, NodeEvent, WiringReceiver};
use wiring_node::HTTP_PROTOCOL;

static INIT: Once = Once::new();

/// Install the test logger once per test binary
pub fn init_test_logging() {
    INIT.call_once(|| {
        LoggingConfig::new()
            .with_default_level(LogLevel::Debug)
            .apply();
    });
}

/// Configuration for a node on 127.0.0.1 with an ephemeral HTTP port, a short
/// TTL and fast rescans, under `root_path`.
pub fn test_node_config(zone: &str, node: &str, root_path: &str) -> NodeConfig {
    NodeConfig::new(zone, node)
        .with_admin_config(
            HttpAdminConfig::new(zone, node)
                .with_host("127.0.0.1")
                .with_port(0)
                .with_connect_timeout(Duration::from_millis(500))
                .with_read_timeout(Duration::from_secs(5)),
        )
        .with_discovery_config(
            DiscoveryConfig::new(zone, node)
                .with_root_path(root_path)
                .with_ttl(Duration::from_secs(5))
                .with_rescan_backoff(Duration::from_millis(50), Duration::from_millis(500)),
        )
}

/// A root path no other test uses
pub fn unique_root() -> String {
    format!("/wiring-test/{}", Uuid::new_v4())
}

/// HTTP descriptor for `service` on `zone/node`, served from `base`
pub fn http_descriptor(zone: &str, node: &str, service: &str, base: &str) -> NodeDescriptor {
    let url = Url::parse(base)
        .and_then(|base| base.join(service))
        .expect("test base url is valid");
    NodeDescriptor::new(EndpointId::new(zone, node, service, HTTP_PROTOCOL), url)
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(limit, async {
        while !condition().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Records every event it receives
pub struct RecordingListener<T> {
    events: Mutex<Vec<NodeEvent<T>>>,
}

impl<T: Clone> RecordingListener<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<NodeEvent<T>> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Event kinds in arrival order, e.g. `["ADDED", "REMOVED"]`
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }

    /// Wait until at least `count` events arrived
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        wait_until(limit, move || async move { self.len() >= count }).await
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> EventListener<T> for RecordingListener<T> {
    async fn on_event(&self, event: NodeEvent<T>) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Replies `echo: <message>` and keeps what it received
#[derive(Default)]
pub struct EchoReceiver {
    received: Mutex<Vec<Message>>,
}

impl EchoReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl WiringReceiver for EchoReceiver {
    async fn message_received(&self, message: Message) -> Result<Option<String>> {
        let reply = format!("echo: {}", message.message);
        self.received.lock().push(message);
        Ok(Some(reply))
    }
}

/// Always fails with `reason`
pub struct FailingReceiver {
    pub reason: String,
}

#[async_trait]
impl WiringReceiver for FailingReceiver {
    async fn message_received(&self, _message: Message) -> Result<Option<String>> {
        Err(anyhow::anyhow!("{}", self.reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_is_valid() {
        let config = test_node_config("z1", "a", &unique_root());
        config.validate().unwrap();
        assert_eq!(config.admin.port, 0);
        assert_eq!(config.discovery.zone, "z1");
    }

    #[test]
    fn test_http_descriptor_joins_base() {
        let d = http_descriptor("z1", "a", "echoService", "http://127.0.0.1:8080/w/");
        assert_eq!(d.url().as_str(), "http://127.0.0.1:8080/w/echoService");
        assert_eq!(d.protocol(), HTTP_PROTOCOL);
    }

    #[test]
    fn test_echo_receiver_records() {
        let echo = EchoReceiver::new();
        let reply =
            tokio_test::block_on(echo.message_received(Message::new("client", "hi"))).unwrap();
        assert_eq!(reply.as_deref(), Some("echo: hi"));
        assert_eq!(echo.received().len(), 1);
    }
}
