//! ClientEndpointPool - Outbound HTTP endpoints keyed by remote identity
//!
//! INTENTION: Keep one client endpoint per imported remote endpoint, route sends
//! by identity, and report endpoints that keep failing.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiring_common::{log_debug, log_error, log_warn, Component, Logger};

use super::{TransportError, FATAL_ERROR_COUNT};
use crate::endpoint::{EndpointId, Message, NodeDescriptor, WireMessage, WireResponse, WiringSender};

/// Health level reported for a failing endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    /// Failing, but below the fatal threshold
    Warning,
    /// Failed more than `FATAL_ERROR_COUNT` times in a row
    Error,
}

#[derive(Debug, Clone)]
pub struct EndpointProblem {
    pub descriptor: NodeDescriptor,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub error: TransportError,
}

/// Callback invoked for endpoint health problems
pub type ProblemCallback = Arc<dyn Fn(EndpointProblem) + Send + Sync>;

/// HttpClientEndpoint - One remote endpoint reached over HTTP
///
/// INTENTION: Post envelopes to the remote url and count consecutive failures.
/// The counter goes back to zero on the first successful exchange.
pub struct HttpClientEndpoint {
    descriptor: NodeDescriptor,
    local_zone: String,
    local_node: String,
    client: Client,
    read_timeout: Duration,
    failures: AtomicU32,
    on_problem: ProblemCallback,
    logger: Logger,
}

impl HttpClientEndpoint {
    fn new(
        descriptor: NodeDescriptor,
        pool: &ClientEndpointPool,
    ) -> Self {
        Self {
            logger: pool.logger.with_endpoint_path(descriptor.id().to_string()),
            descriptor,
            local_zone: pool.local_zone.clone(),
            local_node: pool.local_node.clone(),
            client: pool.client.clone(),
            read_timeout: pool.read_timeout,
            failures: AtomicU32::new(0),
            on_problem: pool.on_problem.clone(),
        }
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub async fn send(&self, message: Message) -> Result<Option<String>, TransportError> {
        let result = self.exchange(message).await;
        match &result {
            Err(e) if e.is_transport_failure() => self.record_failure(e.clone()),
            _ => self.record_success(),
        }
        result
    }

    async fn exchange(&self, message: Message) -> Result<Option<String>, TransportError> {
        let wire = WireMessage::outbound(
            &self.local_zone,
            &self.local_node,
            self.descriptor.id(),
            message,
        );
        let response = self
            .client
            .post(self.descriptor.url().clone())
            .timeout(self.read_timeout)
            .json(&wire)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(status.as_u16()));
        }
        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        match body {
            WireResponse::Result(reply) => Ok(reply),
            WireResponse::Error(failure) => Err(TransportError::Remote {
                kind: failure.kind,
                msg: failure.msg,
                stacktrace: failure.stacktrace,
            }),
        }
    }

    fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        if previous > 0 {
            log_debug!(self.logger, "recovered after {previous} failure(s)");
        }
    }

    /// Warn for failures 1..=FATAL_ERROR_COUNT, then report exactly one error
    fn record_failure(&self, error: TransportError) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let health = if count <= FATAL_ERROR_COUNT {
            log_warn!(self.logger, "send failed ({count} in a row): {error}");
            EndpointHealth::Warning
        } else if count == FATAL_ERROR_COUNT + 1 {
            log_error!(self.logger, "endpoint broken after {count} failures: {error}");
            EndpointHealth::Error
        } else {
            log_debug!(self.logger, "still failing ({count} in a row): {error}");
            return;
        };
        (self.on_problem)(EndpointProblem {
            descriptor: self.descriptor.clone(),
            health,
            consecutive_failures: count,
            error,
        });
    }
}

/// ClientEndpointPool - Manages outbound endpoints using a concurrent map
///
/// INTENTION: Hand out thin senders bound to a remote identity. Removing an
/// endpoint does not cancel sends that already hold it.
pub struct ClientEndpointPool {
    endpoints: DashMap<EndpointId, Arc<HttpClientEndpoint>>,
    local_zone: String,
    local_node: String,
    client: Client,
    read_timeout: Duration,
    on_problem: ProblemCallback,
    logger: Arc<Logger>,
}

impl ClientEndpointPool {
    pub fn new(
        local_zone: &str,
        local_node: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        on_problem: ProblemCallback,
        logger: Arc<Logger>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Io(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            endpoints: DashMap::new(),
            local_zone: local_zone.to_string(),
            local_node: local_node.to_string(),
            client,
            read_timeout,
            on_problem,
            logger: Arc::new(logger.with_component(Component::Transport)),
        })
    }

    /// Get or create the endpoint for this identity and return a sender for it
    ///
    /// INTENTION: Two racing calls may both build an endpoint; the later insert
    /// wins. Endpoints hold no connection state beyond their failure counter.
    pub fn add_endpoint(self: &Arc<Self>, descriptor: &NodeDescriptor) -> PooledSender {
        if !self.endpoints.contains_key(descriptor.id()) {
            let endpoint = Arc::new(HttpClientEndpoint::new(descriptor.clone(), self));
            self.endpoints.insert(descriptor.id().clone(), endpoint);
            log_debug!(self.logger, "added client endpoint {descriptor}");
        }
        PooledSender {
            pool: self.clone(),
            id: descriptor.id().clone(),
        }
    }

    /// Point an existing identity at a new url, keeping its sender valid
    pub fn update_endpoint(&self, descriptor: &NodeDescriptor) {
        let stale = self
            .endpoints
            .get(descriptor.id())
            .map_or(true, |e| !e.descriptor().same_location(descriptor));
        if stale {
            let endpoint = Arc::new(HttpClientEndpoint::new(descriptor.clone(), self));
            self.endpoints.insert(descriptor.id().clone(), endpoint);
            log_debug!(self.logger, "updated client endpoint {descriptor}");
        }
    }

    pub fn remove_endpoint(&self, descriptor: &NodeDescriptor) -> bool {
        let removed = self.endpoints.remove(descriptor.id()).is_some();
        if removed {
            log_debug!(self.logger, "removed client endpoint {descriptor}");
        }
        removed
    }

    pub fn get_endpoint(&self, id: &EndpointId) -> Option<Arc<HttpClientEndpoint>> {
        self.endpoints.get(id).map(|entry| entry.clone())
    }

    /// First endpoint matching zone, node and service id, whatever its protocol
    pub fn find_endpoint(
        &self,
        zone: &str,
        node: &str,
        service_id: &str,
    ) -> Option<Arc<HttpClientEndpoint>> {
        self.endpoints
            .iter()
            .find(|entry| {
                let id = entry.key();
                id.zone == zone && id.node == node && id.service_id == service_id
            })
            .map(|entry| entry.value().clone())
    }

    pub async fn send_message(
        &self,
        id: &EndpointId,
        message: Message,
    ) -> Result<Option<String>, TransportError> {
        // Clone out of the map so no shard lock is held across the request.
        let endpoint = self
            .get_endpoint(id)
            .ok_or_else(|| TransportError::EndpointNotFound {
                zone: id.zone.clone(),
                node: id.node.clone(),
                service_id: id.service_id.clone(),
            })?;
        endpoint.send(message).await
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn clear(&self) {
        self.endpoints.clear();
    }
}

impl std::fmt::Debug for ClientEndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEndpointPool")
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

/// Sender handed to importers; resolves its endpoint on every send
#[derive(Clone)]
pub struct PooledSender {
    pool: Arc<ClientEndpointPool>,
    id: EndpointId,
}

impl PooledSender {
    pub fn id(&self) -> &EndpointId {
        &self.id
    }
}

#[async_trait]
impl WiringSender for PooledSender {
    async fn send_message(&self, message: Message) -> Result<Option<String>, TransportError> {
        self.pool.send_message(&self.id, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::HTTP_PROTOCOL;
    use parking_lot::Mutex;
    use url::Url;

    fn descriptor(url: &str) -> NodeDescriptor {
        NodeDescriptor::new(
            EndpointId::new("z1", "a", "echoService", HTTP_PROTOCOL),
            Url::parse(url).unwrap(),
        )
    }

    fn pool(problems: Arc<Mutex<Vec<EndpointProblem>>>) -> Arc<ClientEndpointPool> {
        let on_problem: ProblemCallback = Arc::new(move |p| problems.lock().push(p));
        Arc::new(
            ClientEndpointPool::new(
                "z1",
                "b",
                Duration::from_millis(200),
                Duration::from_millis(500),
                on_problem,
                Arc::new(Logger::new_root(Component::Node, "z1/b")),
            )
            .unwrap(),
        )
    }

    fn unreachable_url() -> String {
        // Bind and drop a listener so the port is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/w/echoService")
    }

    #[tokio::test]
    async fn test_unknown_identity_is_endpoint_not_found() {
        let pool = pool(Arc::new(Mutex::new(Vec::new())));
        let d = descriptor("http://127.0.0.1:1/w/echoService");
        let result = pool.send_message(d.id(), Message::new("c", "hi")).await;
        assert!(matches!(result, Err(TransportError::EndpointNotFound { .. })));
    }

    #[tokio::test]
    async fn test_add_is_idempotent_and_remove_invalidates_sender() {
        let pool = pool(Arc::new(Mutex::new(Vec::new())));
        let d = descriptor("http://127.0.0.1:1/w/echoService");
        let sender = pool.add_endpoint(&d);
        let first = pool.get_endpoint(d.id()).unwrap();
        pool.add_endpoint(&d);
        assert!(Arc::ptr_eq(&first, &pool.get_endpoint(d.id()).unwrap()));
        assert!(pool.find_endpoint("z1", "a", "echoService").is_some());

        assert!(pool.remove_endpoint(&d));
        assert!(!pool.remove_endpoint(&d));
        let result = sender.send_message(Message::new("c", "hi")).await;
        assert!(matches!(result, Err(TransportError::EndpointNotFound { .. })));
    }

    /// INTENTION: Five failures warn, the sixth reports one error, later failures
    /// stay quiet until a success resets the count.
    #[tokio::test]
    async fn test_failure_escalation_fires_once() {
        let problems = Arc::new(Mutex::new(Vec::new()));
        let pool = pool(problems.clone());
        let d = descriptor(&unreachable_url());
        let sender = pool.add_endpoint(&d);

        for _ in 0..8 {
            let result = sender.send_message(Message::new("c", "hi")).await;
            assert!(matches!(result, Err(TransportError::Io(_))));
        }

        let seen = problems.lock().clone();
        let warnings = seen.iter().filter(|p| p.health == EndpointHealth::Warning).count();
        let errors: Vec<_> = seen.iter().filter(|p| p.health == EndpointHealth::Error).collect();
        assert_eq!(warnings, 5);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].consecutive_failures, 6);
        assert_eq!(pool.get_endpoint(d.id()).unwrap().consecutive_failures(), 8);
    }

    #[tokio::test]
    async fn test_update_endpoint_replaces_only_on_new_url() {
        let pool = pool(Arc::new(Mutex::new(Vec::new())));
        let d = descriptor("http://127.0.0.1:1/w/echoService");
        pool.add_endpoint(&d);
        let first = pool.get_endpoint(d.id()).unwrap();

        pool.update_endpoint(&d);
        assert!(Arc::ptr_eq(&first, &pool.get_endpoint(d.id()).unwrap()));

        let moved = descriptor("http://127.0.0.1:2/w/echoService");
        pool.update_endpoint(&moved);
        let current = pool.get_endpoint(d.id()).unwrap();
        assert_eq!(current.descriptor().url().port(), Some(2));
    }
}
