//! HttpServer - axum front end for the server endpoint registry
//!
//! INTENTION: Expose `POST {path}{endpoint}` for message delivery and
//! `GET {path}` for listing exported endpoints, bound to the admin's host and
//! port. Port 0 binds an ephemeral port; the bound address is reported back so
//! descriptors can carry the real url.

use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use url::Url;
use wiring_common::{log_debug, log_error, log_info, Component, Logger};

use super::server::ServerEndpointRegistry;
use crate::config::HttpAdminConfig;

pub struct HttpServer {
    config: HttpAdminConfig,
    registry: Arc<ServerEndpointRegistry>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    logger: Arc<Logger>,
}

impl HttpServer {
    pub fn new(
        config: HttpAdminConfig,
        registry: Arc<ServerEndpointRegistry>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
            logger: Arc::new(logger.with_component(Component::Transport)),
        }
    }

    /// Routes below the configured base path
    pub fn router(&self) -> Router {
        let base = self.config.path.clone();
        let mut router = Router::new()
            .route(&base, get(list_endpoints))
            .route(&format!("{base}*endpoint"), post(dispatch));
        let trimmed = base.trim_end_matches('/');
        if !trimmed.is_empty() {
            router = router.route(trimmed, get(list_endpoints));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.registry.clone())
    }

    /// Bind and start serving; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let bind_to = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind_to)
            .await
            .map_err(|e| anyhow!("cannot bind {bind_to}: {e}"))?;
        let addr = listener.local_addr()?;

        let (tx, rx) = oneshot::channel();
        let app = self.router();
        let logger = self.logger.clone();
        let task = tokio::spawn(async move {
            let shutdown_logger = logger.clone();
            let result = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    rx.await.ok();
                    log_debug!(shutdown_logger, "HTTP server shutting down");
                })
                .await;
            if let Err(e) = result {
                log_error!(logger, "HTTP server error: {e}");
            }
        });

        *self.shutdown_tx.lock() = Some(tx);
        *self.task.lock() = Some(task);
        *self.local_addr.lock() = Some(addr);
        log_info!(self.logger, "listening on {addr}{}", self.config.path);
        Ok(addr)
    }

    pub async fn stop(&self) -> Result<()> {
        let tx = self.shutdown_tx.lock().take();
        let task = self.task.lock().take();
        self.local_addr.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        if let Some(task) = task {
            task.await
                .map_err(|e| anyhow!("HTTP server task failed: {e}"))?;
            log_info!(self.logger, "HTTP server stopped");
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Base url using the bound port once started, the configured one before
    pub fn base_url(&self) -> Result<Url> {
        let url = match self.local_addr() {
            Some(addr) => self.config.base_url_with_port(addr.port())?,
            None => self.config.base_url()?,
        };
        Ok(url)
    }

    pub fn registry(&self) -> &Arc<ServerEndpointRegistry> {
        &self.registry
    }
}

async fn list_endpoints(State(registry): State<Arc<ServerEndpointRegistry>>) -> impl IntoResponse {
    Json(registry.list_endpoints())
}

async fn dispatch(
    State(registry): State<Arc<ServerEndpointRegistry>>,
    Path(endpoint): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let response = registry.dispatch(&endpoint, &body).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body))
}
