//! HttpAdminFactory - HTTP admin instances sharing one server
//!
//! INTENTION: Run one HTTP server per configuration and hand out one admin
//! instance per consumer key. Instances share the server registry and the
//! local endpoint bus that feeds discovery; each has its own client pool.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;
use wiring_common::{log_debug, log_info, log_warn, Component, Logger};

use super::registration::{
    ExportRegistration, ExportResources, ImportRegistration, ImportResources, OwnedRegistrations,
};
use super::{AdminEvent, WiringAdmin};
use crate::config::HttpAdminConfig;
use crate::endpoint::{NodeDescriptor, WiringReceiver, HTTP_PROTOCOL};
use crate::events::{EventBus, EventListener, SubscriptionId};
use crate::transport::{
    ClientEndpointPool, EndpointHealth, EndpointProblem, HttpServer, ServerEndpointRegistry,
};

const EVENT_CAPACITY: usize = 256;

/// One admin instance, bound to the factory's server
pub struct HttpAdmin {
    id: String,
    zone: String,
    node: String,
    base_url: Url,
    registry: Arc<ServerEndpointRegistry>,
    endpoints: Arc<EventBus<NodeDescriptor>>,
    pool: Arc<ClientEndpointPool>,
    events: broadcast::Sender<AdminEvent>,
    owned: Arc<OwnedRegistrations>,
    stopped: AtomicBool,
    logger: Arc<Logger>,
}

impl HttpAdmin {
    fn new(factory: &HttpAdminFactory, base_url: Url) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let logger = Arc::new(factory.logger.with_endpoint_path(format!("admin={id}")));
        let events = factory.events.clone();
        let problems = events.clone();
        let on_problem = Arc::new(move |problem: EndpointProblem| {
            let message = problem.error.to_string();
            let event = match problem.health {
                EndpointHealth::Warning => AdminEvent::ImportWarning {
                    descriptor: problem.descriptor,
                    message,
                },
                EndpointHealth::Error => AdminEvent::ImportError {
                    descriptor: problem.descriptor,
                    message,
                },
            };
            let _ = problems.send(event);
        });
        let config = &factory.config;
        let pool = ClientEndpointPool::new(
            &config.zone,
            &config.node,
            config.connect_timeout,
            config.read_timeout,
            on_problem,
            logger.clone(),
        )?;
        Ok(Self {
            id,
            zone: config.zone.clone(),
            node: config.node.clone(),
            base_url,
            registry: factory.registry.clone(),
            endpoints: factory.endpoints.clone(),
            pool: Arc::new(pool),
            events,
            owned: Arc::new(OwnedRegistrations::default()),
            stopped: AtomicBool::new(false),
            logger,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn pool(&self) -> &Arc<ClientEndpointPool> {
        &self.pool
    }

    fn failed_export(
        &self,
        service_id: &str,
        descriptor: Option<NodeDescriptor>,
        error: anyhow::Error,
    ) -> Arc<ExportRegistration> {
        log_warn!(self.logger, "export of {service_id} failed: {error:#}");
        let _ = self.events.send(AdminEvent::ExportError {
            service_id: service_id.to_string(),
            message: format!("{error:#}"),
        });
        Arc::new(ExportRegistration::failed(
            service_id,
            descriptor,
            error,
            self.logger.clone(),
        ))
    }

    fn failed_import(
        &self,
        descriptor: &NodeDescriptor,
        error: anyhow::Error,
    ) -> Arc<ImportRegistration> {
        log_warn!(self.logger, "import of {descriptor} failed: {error:#}");
        let _ = self.events.send(AdminEvent::ImportError {
            descriptor: descriptor.clone(),
            message: format!("{error:#}"),
        });
        Arc::new(ImportRegistration::failed(
            descriptor.clone(),
            error,
            self.logger.clone(),
        ))
    }
}

#[async_trait]
impl WiringAdmin for HttpAdmin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn export_endpoint(
        &self,
        receiver: Arc<dyn WiringReceiver>,
        service_id: &str,
    ) -> Arc<ExportRegistration> {
        if self.stopped.load(Ordering::SeqCst) {
            return self.failed_export(service_id, None, anyhow!("admin {} is stopped", self.id));
        }
        if ServerEndpointRegistry::endpoint_name(service_id) != Some(service_id) {
            return self.failed_export(
                service_id,
                None,
                anyhow!("'{service_id}' cannot be used as an endpoint path"),
            );
        }
        let url = NodeDescriptor::http(&self.zone, &self.node, service_id, &self.base_url);
        let descriptor = match url {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let error = anyhow!("cannot build endpoint url: {e}");
                return self.failed_export(service_id, None, error);
            }
        };
        if let Err(e) = self.endpoints.add(descriptor.clone()) {
            return self.failed_export(service_id, Some(descriptor), e.into());
        }
        self.registry.add_endpoint(&descriptor, receiver.clone());

        let registration = Arc::new(ExportRegistration::active(
            descriptor.clone(),
            ExportResources {
                receiver,
                registry: self.registry.clone(),
                endpoints: self.endpoints.clone(),
                events: self.events.clone(),
                owner: Arc::downgrade(&self.owned),
            },
            self.logger.clone(),
        ));
        self.owned
            .exports
            .lock()
            .insert(registration.id(), registration.clone());
        let _ = self
            .events
            .send(AdminEvent::ExportRegistration(descriptor.clone()));
        log_info!(self.logger, "exported {descriptor}");
        registration
    }

    async fn import_endpoint(&self, descriptor: &NodeDescriptor) -> Arc<ImportRegistration> {
        if self.stopped.load(Ordering::SeqCst) {
            return self.failed_import(descriptor, anyhow!("admin {} is stopped", self.id));
        }
        if descriptor.protocol() != HTTP_PROTOCOL {
            return self.failed_import(
                descriptor,
                anyhow!("unsupported protocol {}", descriptor.protocol()),
            );
        }
        let sender = Arc::new(self.pool.add_endpoint(descriptor));
        let registration = Arc::new(ImportRegistration::active(
            descriptor.clone(),
            ImportResources {
                pool: self.pool.clone(),
                sender,
                events: self.events.clone(),
                owner: Arc::downgrade(&self.owned),
            },
            self.logger.clone(),
        ));
        self.owned
            .imports
            .lock()
            .insert(registration.id(), registration.clone());
        let _ = self
            .events
            .send(AdminEvent::ImportRegistration(descriptor.clone()));
        log_info!(self.logger, "imported {descriptor}");
        registration
    }

    fn exported_endpoints(&self) -> Vec<Arc<ExportRegistration>> {
        self.owned.exports.lock().values().cloned().collect()
    }

    fn imported_endpoints(&self) -> Vec<Arc<ImportRegistration>> {
        self.owned.imports.lock().values().cloned().collect()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Collect first; close() removes itself from the owned maps.
        let exports = self.exported_endpoints();
        let imports = self.imported_endpoints();
        for registration in exports {
            registration.close();
        }
        for registration in imports {
            registration.close();
        }
        self.pool.clear();
        log_debug!(self.logger, "admin stopped");
    }
}

/// Creates HTTP admin instances, one per consumer key
pub struct HttpAdminFactory {
    config: HttpAdminConfig,
    registry: Arc<ServerEndpointRegistry>,
    server: HttpServer,
    endpoints: Arc<EventBus<NodeDescriptor>>,
    discovery: Mutex<Option<Arc<dyn EventListener<NodeDescriptor>>>>,
    discovery_subscription: Mutex<Option<SubscriptionId>>,
    instances: Mutex<HashMap<String, Arc<HttpAdmin>>>,
    events: broadcast::Sender<AdminEvent>,
    logger: Arc<Logger>,
}

impl HttpAdminFactory {
    /// Validate the configuration and prepare the server; nothing is bound yet.
    pub fn new(
        config: HttpAdminConfig,
        discovery: Arc<dyn EventListener<NodeDescriptor>>,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let factory = Self::without_discovery(config, logger)?;
        *factory.discovery.lock() = Some(discovery);
        Ok(factory)
    }

    /// Like [`HttpAdminFactory::new`], with exports kept local until
    /// [`HttpAdminFactory::set_discovery`] names a listener.
    pub fn without_discovery(config: HttpAdminConfig, logger: Arc<Logger>) -> Result<Self> {
        config.validate()?;
        config.base_url()?;
        let logger = Arc::new(logger.with_component(Component::Admin));
        let registry = Arc::new(ServerEndpointRegistry::new(
            &config.zone,
            &config.node,
            logger.clone(),
        ));
        let server = HttpServer::new(config.clone(), registry.clone(), logger.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            endpoints: Arc::new(EventBus::new("local-endpoints", logger.clone())),
            config,
            registry,
            server,
            discovery: Mutex::new(None),
            discovery_subscription: Mutex::new(None),
            instances: Mutex::new(HashMap::new()),
            events,
            logger,
        })
    }

    /// Publish admin events on an existing channel instead of a private one
    pub fn with_event_sender(mut self, events: broadcast::Sender<AdminEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &HttpAdminConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AdminEvent> {
        self.events.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.server.local_addr().is_some()
    }

    /// Base url of exported endpoints, with the bound port once started
    pub fn base_url(&self) -> Result<Url> {
        self.server.base_url()
    }

    /// Bind the server and start feeding exported endpoints to discovery
    pub async fn start(&self) -> Result<()> {
        let addr = self.server.start().await?;
        self.attach()?;
        log_info!(self.logger, "HTTP admin started on {addr}: {}", self.config);
        Ok(())
    }

    fn attach(&self) -> Result<()> {
        let mut subscription = self.discovery_subscription.lock();
        if subscription.is_none() {
            if let Some(discovery) = self.discovery.lock().clone() {
                *subscription = Some(self.endpoints.subscribe(discovery)?);
            }
        }
        Ok(())
    }

    /// Feed exported endpoints to another discovery, or to none.
    ///
    /// The previous discovery receives no further events. A newly attached one
    /// first receives every currently exported endpoint as `Added`.
    pub async fn set_discovery(
        &self,
        discovery: Option<Arc<dyn EventListener<NodeDescriptor>>>,
    ) -> Result<()> {
        self.endpoints.flush().await;
        if let Some(id) = self.discovery_subscription.lock().take() {
            self.endpoints.unsubscribe(id);
        }
        *self.discovery.lock() = discovery;
        if self.is_started() {
            self.attach()?;
        }
        Ok(())
    }

    /// Stop every instance, withdraw their endpoints and shut the server down
    pub async fn stop(&self) -> Result<()> {
        let instances: Vec<Arc<HttpAdmin>> =
            self.instances.lock().drain().map(|(_, a)| a).collect();
        for admin in instances {
            admin.stop().await;
        }
        // Let discovery see every withdrawal before it is detached.
        self.endpoints.flush().await;
        if let Some(id) = self.discovery_subscription.lock().take() {
            self.endpoints.unsubscribe(id);
        }
        self.server.stop().await?;
        log_info!(self.logger, "HTTP admin stopped");
        Ok(())
    }

    /// The admin instance for `key`, created on first use
    pub fn acquire(&self, key: &str) -> Result<Arc<HttpAdmin>> {
        if !self.is_started() {
            return Err(anyhow!("HTTP admin factory is not started"));
        }
        let mut instances = self.instances.lock();
        if let Some(admin) = instances.get(key) {
            return Ok(admin.clone());
        }
        let admin = Arc::new(HttpAdmin::new(self, self.base_url()?)?);
        log_debug!(self.logger, "created admin {} for {key}", admin.id());
        instances.insert(key.to_string(), admin.clone());
        Ok(admin)
    }

    /// Stop and forget the instance for `key`
    pub async fn release(&self, key: &str) -> bool {
        let admin = self.instances.lock().remove(key);
        match admin {
            Some(admin) => {
                admin.stop().await;
                log_debug!(self.logger, "released admin for {key}");
                true
            }
            None => false,
        }
    }

    /// Endpoints currently exported through any instance
    pub fn local_endpoints(&self) -> Vec<NodeDescriptor> {
        self.endpoints.known()
    }

    pub async fn flush(&self) {
        self.endpoints.flush().await;
    }
}
