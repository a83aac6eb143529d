// HTTP transport for the wiring admin
//
// The client side keeps one pooled endpoint per imported remote identity and
// tracks its health; the server side maps the last path segment of inbound
// requests to locally exported receivers.

use thiserror::Error;

pub mod client;
pub mod http;
pub mod server;

pub use client::{
    ClientEndpointPool, EndpointHealth, EndpointProblem, HttpClientEndpoint, PooledSender,
};
pub use http::HttpServer;
pub use server::{DispatchError, DispatchResponse, ServerEndpointRegistry};

/// Consecutive failures tolerated before a client endpoint is reported broken
pub const FATAL_ERROR_COUNT: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no endpoint for {zone}/{node}/{service_id}")]
    EndpointNotFound {
        zone: String,
        node: String,
        service_id: String,
    },

    #[error("remote returned HTTP {0}")]
    Http(u16),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("remote {kind}: {msg}")]
    Remote {
        kind: String,
        msg: String,
        stacktrace: String,
    },

    #[error("cannot decode response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Failures that count against the endpoint's health
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Http(_) | TransportError::Io(_) | TransportError::Decode(_)
        )
    }
}
