// Wiring node
//
// Assembles one participant: a directory discovery over the given store, an
// HTTP admin factory feeding it, and a promiscuous topology manager that
// exports every registered receiver and imports every discovered endpoint.
// Admin and discovery can each be reconfigured while the node runs; the
// discovery slot is always locked before the admin slot.

use anyhow::{anyhow, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};
use url::Url;
use wiring_common::{log_debug, log_error, log_info, Component, Logger};

use crate::admin::{AdminEvent, HttpAdmin, HttpAdminFactory, WiringAdmin};
use crate::config::{ConfigError, DiscoveryConfig, HttpAdminConfig, NodeConfig};
use crate::discovery::{DirectoryDiscovery, DirectoryStore, EtcdStore, NodeDiscovery};
use crate::endpoint::{NodeDescriptor, WiringReceiver, WiringSender};
use crate::events::EventListener;
use crate::events::SubscriptionId;
use crate::topology::PromiscuousTopologyManager;

/// Consumer key of the admin instance used by the topology manager
const TOPOLOGY_KEY: &str = "topology";
const SENDER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EVENT_CAPACITY: usize = 256;
/// Request timeout of stores created when the connect url changes
const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

struct AdminSlot {
    factory: Arc<HttpAdminFactory>,
    admin: Arc<HttpAdmin>,
}

struct ActiveDiscovery {
    discovery: Arc<DirectoryDiscovery>,
    subscription: SubscriptionId,
}

/// Last applied discovery settings, the store they point at, and the running
/// discovery unless a required value was left empty
struct DiscoverySlot {
    config: DiscoveryConfig,
    store: Arc<dyn DirectoryStore>,
    active: Option<ActiveDiscovery>,
}

pub struct WiringNode {
    config: NodeConfig,
    discovery: Mutex<DiscoverySlot>,
    /// Running discovery, for synchronous readers
    current_discovery: SyncMutex<Option<Arc<DirectoryDiscovery>>>,
    topology: Arc<PromiscuousTopologyManager>,
    admin: Mutex<AdminSlot>,
    events: broadcast::Sender<AdminEvent>,
    running: AtomicBool,
    logger: Arc<Logger>,
}

impl WiringNode {
    /// Start discovery, the HTTP admin and the topology manager
    pub async fn start(config: NodeConfig, store: Arc<dyn DirectoryStore>) -> Result<Self> {
        let logger = Arc::new(Logger::new_root(Component::Node, &config.node_id()));
        if let Some(logging_config) = &config.logging_config {
            logging_config.apply();
            logger.debug("Applied custom logging configuration");
        }
        config.validate()?;
        logger.info(format!("Starting wiring node {config}"));

        let topology = Arc::new(PromiscuousTopologyManager::new(logger.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let slot = start_admin(config.admin.clone(), None, &topology, &events, &logger).await?;
        let active = match start_discovery(
            config.discovery.clone(),
            store.clone(),
            &topology,
            &slot.factory,
            &logger,
        )
        .await
        {
            Ok(active) => active,
            Err(e) => {
                slot.factory.stop().await?;
                return Err(e);
            }
        };

        logger.info(format!("Wiring node listening at {}", slot.factory.base_url()?));
        Ok(Self {
            current_discovery: SyncMutex::new(Some(active.discovery.clone())),
            discovery: Mutex::new(DiscoverySlot {
                config: config.discovery.clone(),
                store,
                active: Some(active),
            }),
            config,
            topology,
            admin: Mutex::new(slot),
            events,
            running: AtomicBool::new(true),
            logger,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn zone(&self) -> &str {
        &self.config.zone
    }

    pub fn node(&self) -> &str {
        &self.config.node
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The running discovery, `None` while it is switched off
    pub fn discovery(&self) -> Option<Arc<DirectoryDiscovery>> {
        self.current_discovery.lock().clone()
    }

    pub fn topology(&self) -> &Arc<PromiscuousTopologyManager> {
        &self.topology
    }

    /// Registration and health events of the HTTP admin, across reconfigurations
    pub fn admin_events(&self) -> broadcast::Receiver<AdminEvent> {
        self.events.subscribe()
    }

    /// Base url exported endpoints are reachable under
    pub async fn base_url(&self) -> Result<Url> {
        self.admin.lock().await.factory.base_url()
    }

    pub async fn admin_config(&self) -> HttpAdminConfig {
        self.admin.lock().await.factory.config().clone()
    }

    /// Export `receiver` as `service_id`
    pub async fn register_receiver(&self, service_id: &str, receiver: Arc<dyn WiringReceiver>) {
        self.topology.add_receiver(service_id, receiver).await;
    }

    pub async fn unregister_receiver(&self, service_id: &str) -> bool {
        self.topology.remove_receiver(service_id).await
    }

    pub async fn exported_endpoints(&self) -> Vec<NodeDescriptor> {
        self.topology.exported().await
    }

    pub fn discovered_nodes(&self) -> Vec<NodeDescriptor> {
        self.discovery()
            .map(|discovery| discovery.discovered_nodes())
            .unwrap_or_default()
    }

    /// Sender for a remote endpoint, if it has been discovered and imported
    pub async fn sender(
        &self,
        zone: &str,
        node: &str,
        service_id: &str,
    ) -> Option<Arc<dyn WiringSender>> {
        self.topology.sender(zone, node, service_id).await
    }

    /// Wait until a sender for the remote endpoint is available
    pub async fn wait_for_sender(
        &self,
        zone: &str,
        node: &str,
        service_id: &str,
        limit: Duration,
    ) -> Result<Arc<dyn WiringSender>> {
        let wait = async {
            loop {
                if let Some(sender) = self.sender(zone, node, service_id).await {
                    return sender;
                }
                sleep(SENDER_POLL_INTERVAL).await;
            }
        };
        timeout(limit, wait)
            .await
            .map_err(|_| anyhow!("no endpoint {zone}/{node}/{service_id} after {limit:?}"))
    }

    /// Apply new admin properties.
    ///
    /// The properties are parsed and validated before anything is torn down.
    /// Returns false when they match the running configuration. If the new
    /// admin cannot start, the previous configuration is started again and
    /// the error is returned.
    pub async fn reconfigure_admin(&self, properties: &HashMap<String, String>) -> Result<bool> {
        let mut config = HttpAdminConfig::from_properties(properties)?;
        config.zone = self.config.zone.clone();
        config.node = self.config.node.clone();
        config.validate()?;
        config.base_url()?;

        let mut slot = self.admin.lock().await;
        let previous = slot.factory.config().clone();
        if previous == config {
            log_debug!(self.logger, "admin configuration unchanged");
            return Ok(false);
        }

        log_info!(self.logger, "reconfiguring admin: {config}");
        self.topology.remove_admin(slot.admin.id()).await;
        slot.factory.stop().await?;

        let discovery = self.discovery();
        let started =
            start_admin(config, discovery.clone(), &self.topology, &self.events, &self.logger)
                .await;
        match started {
            Ok(next) => {
                *slot = next;
                Ok(true)
            }
            Err(e) => {
                log_error!(self.logger, "new admin configuration failed, restoring: {e:#}");
                *slot =
                    start_admin(previous, discovery, &self.topology, &self.events, &self.logger)
                        .await?;
                Err(e)
            }
        }
    }

    /// Apply new discovery properties.
    ///
    /// The properties are validated before anything is torn down. An empty
    /// zone or node switches discovery off; other invalid values, or an
    /// identity other than the node's own, are rejected. Otherwise the old
    /// discovery withdraws what it published, everything it discovered is
    /// dropped from the topology, and a new discovery takes over the exports.
    /// Returns false when nothing changed.
    pub async fn reconfigure_discovery(
        &self,
        properties: &HashMap<String, String>,
    ) -> Result<bool> {
        if !self.is_running() {
            return Err(anyhow!("node {} is stopped", self.config.node_id()));
        }
        let next = match DiscoveryConfig::from_properties(properties) {
            Ok(config) => Some(config),
            Err(ConfigError::Missing(key)) => {
                log_info!(self.logger, "discovery property '{key}' is empty");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut slot = self.discovery.lock().await;
        let next = next.map(|mut config| {
            config.ttl = slot.config.ttl;
            config.rescan_backoff = slot.config.rescan_backoff;
            config.max_rescan_backoff = slot.config.max_rescan_backoff;
            config
        });
        if let Some(config) = &next {
            if config.zone != self.config.zone || config.node != self.config.node {
                return Err(anyhow!(
                    "discovery identity {}/{} does not match node {}",
                    config.zone,
                    config.node,
                    self.config.node_id()
                ));
            }
        }
        let unchanged = match &next {
            Some(config) => slot.active.is_some() && *config == slot.config,
            None => slot.active.is_none(),
        };
        if unchanged {
            log_debug!(self.logger, "discovery configuration unchanged");
            return Ok(false);
        }

        let store: Arc<dyn DirectoryStore> = match &next {
            Some(config) if config.connect_url != slot.config.connect_url => {
                let url = config.store_url()?;
                Arc::new(EtcdStore::new(&url, STORE_REQUEST_TIMEOUT, self.logger.clone())?)
            }
            _ => slot.store.clone(),
        };

        let admin = self.admin.lock().await;
        admin.factory.set_discovery(None).await?;
        if let Some(previous) = slot.active.take() {
            *self.current_discovery.lock() = None;
            self.stop_discovery(previous).await?;
        }
        let Some(config) = next else {
            log_info!(self.logger, "discovery switched off");
            return Ok(true);
        };

        log_info!(self.logger, "reconfiguring discovery: {config}");
        let previous = std::mem::replace(&mut slot.config, config.clone());
        let previous_store = std::mem::replace(&mut slot.store, store.clone());
        let active =
            match start_discovery(config, store, &self.topology, &admin.factory, &self.logger).await
            {
                Ok(active) => active,
                Err(e) => {
                    log_error!(self.logger, "new discovery configuration failed, restoring: {e:#}");
                    slot.config = previous.clone();
                    slot.store = previous_store.clone();
                    let restored = start_discovery(
                        previous,
                        previous_store,
                        &self.topology,
                        &admin.factory,
                        &self.logger,
                    )
                    .await?;
                    *self.current_discovery.lock() = Some(restored.discovery.clone());
                    slot.active = Some(restored);
                    return Err(e);
                }
            };
        *self.current_discovery.lock() = Some(active.discovery.clone());
        slot.active = Some(active);
        Ok(true)
    }

    /// Detach the topology, withdraw what was published, and forget what was discovered
    async fn stop_discovery(&self, active: ActiveDiscovery) -> Result<()> {
        active.discovery.unsubscribe(active.subscription);
        active.discovery.flush().await;
        active.discovery.stop().await?;
        for descriptor in active.discovery.discovered_nodes() {
            self.topology.discovered_node_removed(&descriptor).await;
        }
        Ok(())
    }

    /// Withdraw everything this node exported and stop all background work
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.logger.info("Stopping wiring node");
        let mut discovery = self.discovery.lock().await;
        let active = discovery.active.take();
        if let Some(active) = &active {
            active.discovery.unsubscribe(active.subscription);
        }
        self.topology.clear().await;
        let slot = self.admin.lock().await;
        slot.factory.stop().await?;
        *self.current_discovery.lock() = None;
        if let Some(active) = active {
            active.discovery.stop().await?;
        }
        self.logger.info("Wiring node stopped");
        Ok(())
    }
}

async fn start_admin(
    config: HttpAdminConfig,
    discovery: Option<Arc<DirectoryDiscovery>>,
    topology: &Arc<PromiscuousTopologyManager>,
    events: &broadcast::Sender<AdminEvent>,
    logger: &Arc<Logger>,
) -> Result<AdminSlot> {
    let factory = match discovery {
        Some(discovery) => HttpAdminFactory::new(config, discovery, logger.clone())?,
        None => HttpAdminFactory::without_discovery(config, logger.clone())?,
    };
    let factory = factory.with_event_sender(events.clone());
    let factory = Arc::new(factory);
    factory.start().await?;
    let admin = match factory.acquire(TOPOLOGY_KEY) {
        Ok(admin) => admin,
        Err(e) => {
            factory.stop().await?;
            return Err(e);
        }
    };
    topology.add_admin(admin.clone()).await;
    Ok(AdminSlot { factory, admin })
}

/// Start a discovery, attach the topology to it, then hand it the factory's exports
async fn start_discovery(
    config: DiscoveryConfig,
    store: Arc<dyn DirectoryStore>,
    topology: &Arc<PromiscuousTopologyManager>,
    factory: &HttpAdminFactory,
    logger: &Arc<Logger>,
) -> Result<ActiveDiscovery> {
    let discovery = DirectoryDiscovery::new(config, store, logger.clone());
    let subscription = discovery.subscribe(topology.clone())?;
    if let Err(e) = discovery.start().await {
        discovery.unsubscribe(subscription);
        return Err(e);
    }
    let listener: Arc<dyn EventListener<NodeDescriptor>> = discovery.clone();
    if let Err(e) = factory.set_discovery(Some(listener)).await {
        discovery.unsubscribe(subscription);
        discovery.stop().await?;
        return Err(e);
    }
    Ok(ActiveDiscovery {
        discovery,
        subscription,
    })
}
