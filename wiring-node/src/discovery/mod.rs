// Node discovery
//
// A discovery keeps two sets: endpoints published by this node, which it
// advertises, and endpoints discovered on other nodes, which it announces on
// an event bus. Local exports reach a discovery as events on the admin's
// endpoint bus, so every discovery is also an `EventListener`.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::endpoint::NodeDescriptor;
use crate::events::{EventBusError, EventListener, SubscriptionId};

pub mod directory;
pub mod etcd_store;
pub mod memory_store;
pub mod store;

pub use directory::DirectoryDiscovery;
pub use etcd_store::EtcdStore;
pub use memory_store::MemoryStore;
pub use store::{DirectoryStore, StoreAction, StoreError, StoreNode, StoreResponse};

#[async_trait]
pub trait NodeDiscovery: EventListener<NodeDescriptor> + Send + Sync {
    /// Scan, start watching and start advertising published endpoints
    async fn start(&self) -> Result<()>;

    /// Stop background work and withdraw published endpoints
    async fn stop(&self) -> Result<()>;

    /// Receive Added/Removed/Modified for remote endpoints, with replay
    fn subscribe(
        &self,
        listener: Arc<dyn EventListener<NodeDescriptor>>,
    ) -> Result<SubscriptionId, EventBusError>;

    fn unsubscribe(&self, id: SubscriptionId);

    fn discovered_nodes(&self) -> Vec<NodeDescriptor>;

    async fn add_published_node(&self, descriptor: NodeDescriptor);

    async fn remove_published_node(&self, descriptor: &NodeDescriptor);
}
