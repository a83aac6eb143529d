// Directory-store backed discovery
//
// Layout below the root path:
//
//   {zone}/{node}/metadata                            node presence, only without endpoints
//   {zone}/{node}/{service_id}/{protocol}/url
//   {zone}/{node}/{service_id}/{protocol}/metadata
//   {zone}/{node}/{service_id}/{protocol}/complete    written last, value "true"
//
// An endpoint exists for readers only once its `complete` key is "true".
// Every directory and key carries the TTL and is rewritten by a periodic task.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use url::Url;
use wiring_common::{log_debug, log_error, log_info, log_warn, Component, Logger};

use super::store::{
    join_path, relative_segments, DirectoryStore, StoreError, StoreNode, StoreResponse,
};
use super::NodeDiscovery;
use crate::config::DiscoveryConfig;
use crate::endpoint::{EndpointId, NodeDescriptor};
use crate::events::{EventBus, EventBusError, EventListener, NodeEvent, SubscriptionId};

const KEY_URL: &str = "url";
const KEY_METADATA: &str = "metadata";
const KEY_COMPLETE: &str = "complete";
const COMPLETE_VALUE: &str = "true";

/// Depth of a protocol directory below the root
const PROTOCOL_DEPTH: usize = 4;

pub struct DirectoryDiscovery {
    config: DiscoveryConfig,
    store: Arc<dyn DirectoryStore>,
    discovered: EventBus<NodeDescriptor>,
    published: RwLock<HashMap<EndpointId, NodeDescriptor>>,
    running: AtomicBool,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    republish_task: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<DirectoryDiscovery>,
    logger: Arc<Logger>,
}

impl DirectoryDiscovery {
    /// Must be called inside a tokio runtime (the discovered-node bus spawns its worker).
    pub fn new(
        config: DiscoveryConfig,
        store: Arc<dyn DirectoryStore>,
        logger: Arc<Logger>,
    ) -> Arc<Self> {
        let logger = Arc::new(logger.with_component(Component::Discovery));
        Arc::new_cyclic(|self_ref| Self {
            discovered: EventBus::new("discovered", logger.clone()),
            config,
            store,
            published: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            watch_task: Mutex::new(None),
            republish_task: Mutex::new(None),
            self_ref: self_ref.clone(),
            logger,
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until every discovered-node event so far reached the listeners
    pub async fn flush(&self) {
        self.discovered.flush().await;
    }

    fn root(&self) -> String {
        join_path(&self.config.root_path, &[])
    }

    fn is_local(&self, id: &EndpointId) -> bool {
        id.is_on(&self.config.zone, &self.config.node)
    }

    fn protocol_path(&self, id: &EndpointId) -> String {
        join_path(
            &self.config.root_path,
            &[&id.zone, &id.node, &id.service_id, &id.protocol],
        )
    }

    fn presence_key(&self) -> String {
        join_path(
            &self.config.root_path,
            &[&self.config.zone, &self.config.node, KEY_METADATA],
        )
    }

    // ---------------------------------------------------------------------
    // Discovered side
    // ---------------------------------------------------------------------

    /// Announce a remote endpoint; a known endpoint at a new url is Modified.
    pub fn add_discovered_node(&self, descriptor: NodeDescriptor) {
        if self.is_local(descriptor.id()) {
            log_debug!(self.logger, "ignoring own endpoint {descriptor}");
            return;
        }
        let result = match self.discovered.get(&descriptor) {
            Some(existing) if existing.same_location(&descriptor) => Ok(()),
            Some(_) => {
                log_info!(self.logger, "endpoint moved: {descriptor}");
                self.discovered.modify(descriptor)
            }
            None => {
                log_info!(self.logger, "discovered endpoint {descriptor}");
                self.discovered.add(descriptor)
            }
        };
        self.check_bus(result);
    }

    pub fn remove_discovered_node(&self, descriptor: &NodeDescriptor) {
        if self.is_local(descriptor.id()) || !self.discovered.contains(descriptor) {
            return;
        }
        log_info!(self.logger, "lost endpoint {descriptor}");
        let result = self.discovered.remove(descriptor.clone());
        self.check_bus(result);
    }

    /// Replace the discovered view with a full snapshot, announcing only the difference
    pub fn set_discovered_nodes(&self, snapshot: Vec<NodeDescriptor>) {
        let snapshot: HashMap<EndpointId, NodeDescriptor> = snapshot
            .into_iter()
            .filter(|d| !self.is_local(d.id()))
            .map(|d| (d.id().clone(), d))
            .collect();

        for known in self.discovered.known() {
            if !snapshot.contains_key(known.id()) {
                self.remove_discovered_node(&known);
            }
        }
        for descriptor in snapshot.into_values() {
            self.add_discovered_node(descriptor);
        }
    }

    fn check_bus(&self, result: Result<(), EventBusError>) {
        if let Err(e) = result {
            log_error!(self.logger, "discovered-node bookkeeping failed: {e}");
        }
    }

    /// Every complete endpoint in a recursively fetched root
    fn materialize(&self, root: &StoreNode) -> Vec<NodeDescriptor> {
        let mut found = Vec::new();
        let dirs = |node: &StoreNode| -> Vec<StoreNode> {
            node.nodes.iter().filter(|n| n.dir).cloned().collect()
        };
        for zone in dirs(root) {
            for node in dirs(&zone) {
                for service in dirs(&node) {
                    for protocol in dirs(&service) {
                        let id = EndpointId::new(
                            zone.name(),
                            node.name(),
                            service.name(),
                            protocol.name(),
                        );
                        if let Some(descriptor) = self.complete_descriptor(id, &protocol) {
                            found.push(descriptor);
                        }
                    }
                }
            }
        }
        found
    }

    /// Build a descriptor from a protocol directory, if it is complete
    fn complete_descriptor(&self, id: EndpointId, protocol: &StoreNode) -> Option<NodeDescriptor> {
        let complete = protocol
            .child(KEY_COMPLETE)
            .and_then(|n| n.value.as_deref())
            == Some(COMPLETE_VALUE);
        if !complete {
            log_debug!(self.logger, "skipping incomplete endpoint {id}");
            return None;
        }
        let raw = protocol.child(KEY_URL).and_then(|n| n.value.as_deref())?;
        match Url::parse(raw) {
            Ok(url) => Some(NodeDescriptor::new(id, url)),
            Err(e) => {
                log_warn!(self.logger, "malformed url '{raw}' for {id}: {e}");
                None
            }
        }
    }

    /// Full scan of the directory. Returns the index to resume watching after.
    pub async fn rescan(&self) -> Result<u64, StoreError> {
        let root = self.root();
        let response = match self.store.get(&root, true).await {
            Ok(response) => response,
            Err(StoreError::NotFound(_)) => {
                let created = self.store.put_dir(&root, None, None).await?;
                self.set_discovered_nodes(Vec::new());
                return Ok(resume_index(&created));
            }
            Err(e) => return Err(e),
        };
        let index = resume_index(&response);
        let descriptors = self.materialize(&response.node);
        log_debug!(
            self.logger,
            "scan found {} complete endpoint(s) at index {index}",
            descriptors.len()
        );
        self.set_discovered_nodes(descriptors);
        Ok(index)
    }

    /// Watch loop. Holds the discovery only while handling a change or
    /// rescanning, so a dropped discovery ends the loop.
    async fn run_watch(this: Weak<Self>, mut next_index: Option<u64>) {
        let Some((store, config, logger)) = this
            .upgrade()
            .map(|d| (d.store.clone(), d.config.clone(), d.logger.clone()))
        else {
            return;
        };
        let root = join_path(&config.root_path, &[]);
        let mut backoff = config.rescan_backoff;
        loop {
            let index = match next_index {
                Some(index) => index,
                None => {
                    let Some(discovery) = this.upgrade() else {
                        return;
                    };
                    match discovery.rescan().await {
                        Ok(index) => {
                            backoff = config.rescan_backoff;
                            index + 1
                        }
                        Err(e) => {
                            drop(discovery);
                            log_warn!(
                                logger,
                                "rescan failed: {e}, retrying in {}ms",
                                backoff.as_millis()
                            );
                            sleep(backoff).await;
                            backoff = (backoff * 2).min(config.max_rescan_backoff);
                            continue;
                        }
                    }
                }
            };
            log_debug!(logger, "watching {root} from index {index}");
            match store.watch(&root, index, true).await {
                Ok(response) => {
                    let Some(discovery) = this.upgrade() else {
                        return;
                    };
                    let modified = response.node.modified_index;
                    if let Err(e) = discovery.handle_change(&response).await {
                        log_warn!(
                            logger,
                            "could not handle change of {} at index {modified}: {e}",
                            response.node.key
                        );
                    }
                    next_index = Some(modified.max(index) + 1);
                }
                Err(e) => {
                    log_warn!(logger, "watch at index {index} failed: {e}, rescanning");
                    if !matches!(e, StoreError::IndexCleared { .. }) {
                        sleep(config.rescan_backoff).await;
                    }
                    next_index = None;
                }
            }
        }
    }

    /// Apply one watch event to the discovered view
    pub async fn handle_change(&self, response: &StoreResponse) -> Result<(), StoreError> {
        let node = &response.node;
        let Some(segments) = relative_segments(&self.config.root_path, &node.key) else {
            return Ok(());
        };
        log_debug!(
            self.logger,
            "change {:?} on {} at index {}",
            response.action,
            node.key,
            node.modified_index
        );

        if response.action.is_removal() {
            let leaf_of_endpoint = !node.dir && segments.len() == PROTOCOL_DEPTH + 1;
            let endpoint_dir = node.dir && segments.len() <= PROTOCOL_DEPTH;
            if !leaf_of_endpoint && !endpoint_dir {
                return Ok(());
            }
            let prefix = &segments[..segments.len().min(PROTOCOL_DEPTH)];
            for known in self.discovered.known() {
                if known.id().matches_prefix(prefix) {
                    self.remove_discovered_node(&known);
                }
            }
            return Ok(());
        }

        let is_complete_marker = response.action.is_write()
            && !node.dir
            && segments.len() == PROTOCOL_DEPTH + 1
            && segments[PROTOCOL_DEPTH] == KEY_COMPLETE
            && node.value.as_deref() == Some(COMPLETE_VALUE);
        if !is_complete_marker {
            // an intermediate write of a multi-key update
            return Ok(());
        }

        let id = EndpointId::new(segments[0], segments[1], segments[2], segments[3]);
        if self.is_local(&id) {
            return Ok(());
        }
        let protocol = self.store.get(&self.protocol_path(&id), false).await?;
        match self.complete_descriptor(id, &protocol.node) {
            Some(descriptor) => self.add_discovered_node(descriptor),
            None => log_warn!(self.logger, "complete marker without usable url at {}", node.key),
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Published side
    // ---------------------------------------------------------------------

    async fn put_dir(&self, path: &str) -> Result<(), StoreError> {
        let ttl = Some(self.config.ttl);
        match self.store.put_dir(path, ttl, Some(false)).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => {
                self.store.put_dir(path, ttl, Some(true)).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn put_node_dirs(&self, zone: &str, node: &str) -> Result<(), StoreError> {
        self.put_dir(&join_path(&self.config.root_path, &[zone])).await?;
        self.put_dir(&join_path(&self.config.root_path, &[zone, node])).await
    }

    async fn put_presence(&self) -> Result<(), StoreError> {
        self.put_node_dirs(&self.config.zone, &self.config.node).await?;
        let metadata = json!({ "zone": self.config.zone, "node": self.config.node });
        self.store
            .put(&self.presence_key(), &metadata.to_string(), Some(self.config.ttl))
            .await
            .map(|_| ())
    }

    /// Write one endpoint: directories, url, metadata, then the complete marker
    async fn put_endpoint(&self, descriptor: &NodeDescriptor) -> Result<(), StoreError> {
        let id = descriptor.id();
        let ttl = Some(self.config.ttl);
        self.put_node_dirs(&id.zone, &id.node).await?;
        self.put_dir(&join_path(
            &self.config.root_path,
            &[&id.zone, &id.node, &id.service_id],
        ))
        .await?;
        let protocol_path = self.protocol_path(id);
        self.put_dir(&protocol_path).await?;

        let metadata = json!({
            "zone": id.zone,
            "node": id.node,
            "serviceId": id.service_id,
            "protocol": id.protocol,
        });
        self.store
            .put(&join_path(&protocol_path, &[KEY_URL]), descriptor.url().as_str(), ttl)
            .await?;
        self.store
            .put(&join_path(&protocol_path, &[KEY_METADATA]), &metadata.to_string(), ttl)
            .await?;
        self.store
            .put(&join_path(&protocol_path, &[KEY_COMPLETE]), COMPLETE_VALUE, ttl)
            .await?;
        Ok(())
    }

    async fn delete_endpoint(&self, descriptor: &NodeDescriptor) -> Result<(), StoreError> {
        match self
            .store
            .delete_dir(&self.protocol_path(descriptor.id()), true)
            .await
        {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Rewrite everything this node advertises
    pub async fn republish(&self) {
        let published = self.published.read().await;
        if published.is_empty() {
            if let Err(e) = self.put_presence().await {
                log_warn!(self.logger, "node presence update failed: {e}");
            }
        }
        for descriptor in published.values() {
            if let Err(e) = self.put_endpoint(descriptor).await {
                log_warn!(self.logger, "republishing {descriptor} failed: {e}");
            }
        }
    }

    async fn run_republish(this: Weak<Self>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(discovery) = this.upgrade() else {
                return;
            };
            log_debug!(discovery.logger, "refreshing published endpoints");
            discovery.republish().await;
        }
    }

    pub async fn published_nodes(&self) -> Vec<NodeDescriptor> {
        self.published.read().await.values().cloned().collect()
    }
}

/// Index a watch should resume after: the store index when reported, else
/// the node's own index, raised to anything newer in the returned subtree.
fn resume_index(response: &StoreResponse) -> u64 {
    let base = response.index.unwrap_or(response.node.modified_index);
    base.max(response.node.max_modified_index())
}

impl Drop for DirectoryDiscovery {
    fn drop(&mut self) {
        for task in [self.watch_task.get_mut().take(), self.republish_task.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl NodeDiscovery for DirectoryDiscovery {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log_info!(self.logger, "starting: {}", self.config);

        let next_index = match self.rescan().await {
            Ok(index) => Some(index + 1),
            Err(e) => {
                log_error!(self.logger, "initial scan of {} failed: {e}", self.root());
                None
            }
        };
        let watch = Self::run_watch(self.self_ref.clone(), next_index);
        *self.watch_task.lock() = Some(tokio::spawn(watch));

        self.republish().await;
        let period = self.config.refresh_interval();
        let republish = Self::run_republish(self.self_ref.clone(), period);
        *self.republish_task.lock() = Some(tokio::spawn(republish));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.republish_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }

        let published = self.published.read().await;
        for descriptor in published.values() {
            if let Err(e) = self.delete_endpoint(descriptor).await {
                log_warn!(self.logger, "could not withdraw {descriptor}: {e}");
            }
        }
        match self.store.delete(&self.presence_key()).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => log_warn!(self.logger, "could not withdraw node presence: {e}"),
        }
        log_info!(self.logger, "stopped");
        Ok(())
    }

    fn subscribe(
        &self,
        listener: Arc<dyn EventListener<NodeDescriptor>>,
    ) -> Result<SubscriptionId, EventBusError> {
        self.discovered.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.discovered.unsubscribe(id);
    }

    fn discovered_nodes(&self) -> Vec<NodeDescriptor> {
        self.discovered.known()
    }

    async fn add_published_node(&self, descriptor: NodeDescriptor) {
        let mut published = self.published.write().await;
        published.insert(descriptor.id().clone(), descriptor.clone());
        if !self.is_running() {
            return;
        }
        match self.put_endpoint(&descriptor).await {
            Ok(()) => log_info!(self.logger, "published {descriptor}"),
            Err(e) => log_error!(self.logger, "error publishing {descriptor}: {e}"),
        }
    }

    async fn remove_published_node(&self, descriptor: &NodeDescriptor) {
        let mut published = self.published.write().await;
        if published.remove(descriptor.id()).is_none() || !self.is_running() {
            return;
        }
        match self.delete_endpoint(descriptor).await {
            Ok(()) => log_info!(self.logger, "withdrew {descriptor}"),
            Err(e) => log_error!(self.logger, "error withdrawing {descriptor}: {e}"),
        }
    }
}

#[async_trait]
impl EventListener<NodeDescriptor> for DirectoryDiscovery {
    async fn on_event(&self, event: NodeEvent<NodeDescriptor>) -> Result<()> {
        match event {
            NodeEvent::Added(d) | NodeEvent::Modified(d) => self.add_published_node(d).await,
            NodeEvent::Removed(d) => self.remove_published_node(&d).await,
        }
        Ok(())
    }
}
