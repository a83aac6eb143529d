// Server-side endpoint registry
//
// Maps the endpoint name taken from an inbound request path to the receiver
// exported under it. Lookups and listings share a read lock; registration
// changes take the write lock. Receivers are always invoked outside the lock.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use wiring_common::{log_debug, log_error, log_warn, Component, Logger};

use crate::endpoint::{NodeDescriptor, RemoteFailure, WireMessage, WireResponse, WiringReceiver};

lazy_static! {
    static ref PATH_PATTERN: Regex =
        Regex::new(r"^/?([A-Za-z0-9_-]+)/?$").expect("endpoint path pattern is valid");
}

/// Error kind reported when a receiver returns an error
const RECEIVER_ERROR: &str = "ReceiverError";

/// Requests rejected before or instead of reaching a receiver
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("malformed endpoint path '{0}'")]
    MalformedPath(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message originates from the receiving node")]
    FromSelf,

    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("receiver {0} failed unexpectedly")]
    Internal(String),
}

impl DispatchError {
    /// HTTP status reported for this rejection
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::MalformedPath(_)
            | DispatchError::MalformedMessage(_)
            | DispatchError::FromSelf => 400,
            DispatchError::UnknownEndpoint(_) => 404,
            DispatchError::Internal(_) => 500,
        }
    }
}

/// Status code and JSON body for one dispatched request
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    pub status: u16,
    pub body: Value,
}

impl From<Result<WireResponse, DispatchError>> for DispatchResponse {
    fn from(result: Result<WireResponse, DispatchError>) -> Self {
        match result {
            Ok(response) => Self {
                status: 200,
                body: serde_json::to_value(response).unwrap_or(Value::Null),
            },
            Err(e) => Self {
                status: e.status(),
                body: json!({ "error": e.to_string() }),
            },
        }
    }
}

struct ServerEndpoint {
    descriptor: NodeDescriptor,
    receiver: Arc<dyn WiringReceiver>,
}

pub struct ServerEndpointRegistry {
    endpoints: RwLock<HashMap<String, ServerEndpoint>>,
    local_zone: String,
    local_node: String,
    logger: Arc<Logger>,
}

impl ServerEndpointRegistry {
    pub fn new(local_zone: &str, local_node: &str, logger: Arc<Logger>) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            local_zone: local_zone.to_string(),
            local_node: local_node.to_string(),
            logger: Arc::new(logger.with_component(Component::Transport)),
        }
    }

    /// Register a receiver under the descriptor's service id, replacing any previous one
    pub fn add_endpoint(&self, descriptor: &NodeDescriptor, receiver: Arc<dyn WiringReceiver>) {
        let key = descriptor.service_id().to_string();
        let previous = self.endpoints.write().insert(
            key.clone(),
            ServerEndpoint {
                descriptor: descriptor.clone(),
                receiver,
            },
        );
        if previous.is_some() {
            log_warn!(self.logger, "replaced receiver for {key}");
        } else {
            log_debug!(self.logger, "added server endpoint {descriptor}");
        }
    }

    /// Remove the endpoint if it is still registered for this descriptor
    pub fn remove_endpoint(&self, descriptor: &NodeDescriptor) -> bool {
        let mut endpoints = self.endpoints.write();
        let registered = endpoints
            .get(descriptor.service_id())
            .is_some_and(|e| e.descriptor == *descriptor);
        if registered {
            endpoints.remove(descriptor.service_id());
            log_debug!(self.logger, "removed server endpoint {descriptor}");
        }
        registered
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.endpoints.read().contains_key(service_id)
    }

    /// Registered endpoint names, sorted
    pub fn list_endpoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.endpoints.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Extract the endpoint name from a path relative to the admin's base path
    pub fn endpoint_name(path: &str) -> Option<&str> {
        PATH_PATTERN
            .captures(path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Handle one POST: 400 for a bad path or body, 404 for an unknown endpoint,
    /// 200 with `{"r"}` or `{"e"}` otherwise, 500 if the receiver panics.
    pub async fn dispatch(&self, path: &str, body: &[u8]) -> DispatchResponse {
        let result = self.try_dispatch(path, body).await;
        if let Err(e) = &result {
            match e {
                DispatchError::Internal(_) => log_error!(self.logger, "{e}"),
                DispatchError::FromSelf => {
                    log_warn!(self.logger, "rejecting request to '{path}': {e}");
                }
                _ => log_debug!(self.logger, "rejecting request to '{path}': {e}"),
            }
        }
        result.into()
    }

    async fn try_dispatch(&self, path: &str, body: &[u8]) -> Result<WireResponse, DispatchError> {
        let name = Self::endpoint_name(path)
            .ok_or_else(|| DispatchError::MalformedPath(path.to_string()))?;

        let mut wire: WireMessage = serde_json::from_slice(body)
            .map_err(|e| DispatchError::MalformedMessage(e.to_string()))?;

        let receiver = self
            .endpoints
            .read()
            .get(name)
            .map(|endpoint| endpoint.receiver.clone())
            .ok_or_else(|| DispatchError::UnknownEndpoint(name.to_string()))?;

        wire.switch_remote_local();
        if wire.remote_zone == self.local_zone && wire.remote_node == self.local_node {
            return Err(DispatchError::FromSelf);
        }
        if !wire.local_path.is_empty() && wire.local_path != name {
            log_debug!(
                self.logger,
                "message addressed to '{}' delivered to {name}",
                wire.local_path
            );
        }

        let message = wire.into_message(name);
        let task = tokio::spawn(async move { receiver.message_received(message).await });
        match task.await {
            Ok(Ok(reply)) => Ok(WireResponse::Result(reply)),
            Ok(Err(e)) => {
                log_debug!(self.logger, "receiver {name} failed: {e:#}");
                Ok(WireResponse::Error(RemoteFailure {
                    kind: RECEIVER_ERROR.to_string(),
                    msg: format!("{e:#}"),
                    stacktrace: format!("{e:?}"),
                }))
            }
            Err(e) => Err(DispatchError::Internal(format!("{name}: {e}"))),
        }
    }
}
