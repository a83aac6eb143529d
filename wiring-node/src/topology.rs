//! PromiscuousTopologyManager - export everything, import everything
//!
//! INTENTION: Keep every admin exporting every locally registered receiver
//! and importing every discovered remote endpoint. Admins, receivers and
//! discovered endpoints can come and go in any order; the manager converges
//! on the cross product of what is currently present.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use wiring_common::{log_debug, log_info, log_warn, Component, Logger};

use crate::admin::{ExportRegistration, ImportRegistration, WiringAdmin};
use crate::endpoint::{EndpointId, NodeDescriptor, WiringReceiver, WiringSender};
use crate::events::{EventListener, NodeEvent};

#[derive(Default)]
struct TopologyState {
    admins: HashMap<String, Arc<dyn WiringAdmin>>,
    receivers: HashMap<String, Arc<dyn WiringReceiver>>,
    discovered: HashMap<EndpointId, NodeDescriptor>,
    /// keyed by (admin id, service id)
    exports: HashMap<(String, String), Arc<ExportRegistration>>,
    /// keyed by (admin id, remote identity)
    imports: HashMap<(String, EndpointId), Arc<ImportRegistration>>,
}

pub struct PromiscuousTopologyManager {
    state: Mutex<TopologyState>,
    logger: Arc<Logger>,
}

impl PromiscuousTopologyManager {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            state: Mutex::new(TopologyState::default()),
            logger: Arc::new(logger.with_component(Component::Topology)),
        }
    }

    pub async fn add_admin(&self, admin: Arc<dyn WiringAdmin>) {
        let mut state = self.state.lock().await;
        let admin_id = admin.id().to_string();
        if state.admins.contains_key(&admin_id) {
            return;
        }
        log_info!(self.logger, "admin {admin_id} added");
        state.admins.insert(admin_id, admin.clone());

        let receivers: Vec<_> = state
            .receivers
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        for (service_id, receiver) in receivers {
            self.export(&mut state, &admin, &service_id, receiver).await;
        }
        let discovered: Vec<_> = state.discovered.values().cloned().collect();
        for descriptor in discovered {
            self.import(&mut state, &admin, &descriptor).await;
        }
    }

    /// Close everything the admin exported or imported for this manager
    pub async fn remove_admin(&self, admin_id: &str) {
        let mut state = self.state.lock().await;
        if state.admins.remove(admin_id).is_none() {
            return;
        }
        log_info!(self.logger, "admin {admin_id} removed");
        state.exports.retain(|(owner, _), registration| {
            if owner == admin_id {
                registration.close();
                false
            } else {
                true
            }
        });
        state.imports.retain(|(owner, _), registration| {
            if owner == admin_id {
                registration.close();
                false
            } else {
                true
            }
        });
    }

    /// Export `receiver` as `service_id` through every admin, replacing an earlier one
    pub async fn add_receiver(&self, service_id: &str, receiver: Arc<dyn WiringReceiver>) {
        let mut state = self.state.lock().await;
        if state
            .receivers
            .insert(service_id.to_string(), receiver.clone())
            .is_some()
        {
            log_debug!(self.logger, "replacing receiver {service_id}");
            close_exports(&mut state, service_id);
        }
        let admins: Vec<_> = state.admins.values().cloned().collect();
        for admin in admins {
            self.export(&mut state, &admin, service_id, receiver.clone()).await;
        }
    }

    pub async fn remove_receiver(&self, service_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.receivers.remove(service_id).is_none() {
            return false;
        }
        close_exports(&mut state, service_id);
        log_debug!(self.logger, "receiver {service_id} removed");
        true
    }

    pub async fn discovered_node_added(&self, descriptor: NodeDescriptor) {
        let mut state = self.state.lock().await;
        state
            .discovered
            .insert(descriptor.id().clone(), descriptor.clone());
        let admins: Vec<_> = state.admins.values().cloned().collect();
        for admin in admins {
            self.import(&mut state, &admin, &descriptor).await;
        }
    }

    pub async fn discovered_node_modified(&self, descriptor: NodeDescriptor) {
        let mut state = self.state.lock().await;
        state
            .discovered
            .insert(descriptor.id().clone(), descriptor.clone());
        let mut missing = Vec::new();
        for (admin_id, admin) in state.admins.iter() {
            match state.imports.get(&(admin_id.clone(), descriptor.id().clone())) {
                Some(registration) => {
                    if let Err(e) = registration.update(descriptor.clone()) {
                        log_warn!(self.logger, "cannot update import of {descriptor}: {e}");
                    }
                }
                None => missing.push(admin.clone()),
            }
        }
        for admin in missing {
            self.import(&mut state, &admin, &descriptor).await;
        }
    }

    pub async fn discovered_node_removed(&self, descriptor: &NodeDescriptor) {
        let mut state = self.state.lock().await;
        state.discovered.remove(descriptor.id());
        state.imports.retain(|(_, id), registration| {
            if id == descriptor.id() {
                registration.close();
                false
            } else {
                true
            }
        });
        log_debug!(self.logger, "dropped imports of {descriptor}");
    }

    /// A sender for the remote endpoint, through any admin that imported it
    pub async fn sender(
        &self,
        zone: &str,
        node: &str,
        service_id: &str,
    ) -> Option<Arc<dyn WiringSender>> {
        let state = self.state.lock().await;
        state
            .imports
            .iter()
            .filter(|((_, id), _)| {
                id.zone == zone && id.node == node && id.service_id == service_id
            })
            .find_map(|(_, registration)| registration.reference())
    }

    pub async fn exported(&self) -> Vec<NodeDescriptor> {
        let state = self.state.lock().await;
        state.exports.values().filter_map(|r| r.reference()).collect()
    }

    pub async fn imported(&self) -> Vec<NodeDescriptor> {
        let state = self.state.lock().await;
        state.imports.values().filter_map(|r| r.descriptor()).collect()
    }

    /// Close every registration made for this manager
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        for (_, registration) in state.exports.drain() {
            registration.close();
        }
        for (_, registration) in state.imports.drain() {
            registration.close();
        }
        state.admins.clear();
    }

    async fn export(
        &self,
        state: &mut TopologyState,
        admin: &Arc<dyn WiringAdmin>,
        service_id: &str,
        receiver: Arc<dyn WiringReceiver>,
    ) {
        let key = (admin.id().to_string(), service_id.to_string());
        if state.exports.contains_key(&key) {
            return;
        }
        let registration = admin.export_endpoint(receiver, service_id).await;
        match registration.error() {
            Some(e) => log_warn!(
                self.logger,
                "export of {service_id} via {} failed: {e:#}",
                admin.id()
            ),
            None => {
                state.exports.insert(key, registration);
            }
        }
    }

    async fn import(
        &self,
        state: &mut TopologyState,
        admin: &Arc<dyn WiringAdmin>,
        descriptor: &NodeDescriptor,
    ) {
        let key = (admin.id().to_string(), descriptor.id().clone());
        if state.imports.contains_key(&key) {
            return;
        }
        let registration = admin.import_endpoint(descriptor).await;
        match registration.error() {
            Some(e) => log_debug!(self.logger, "{} did not import {descriptor}: {e:#}", admin.id()),
            None => {
                state.imports.insert(key, registration);
            }
        }
    }
}

fn close_exports(state: &mut TopologyState, service_id: &str) {
    state.exports.retain(|(_, exported), registration| {
        if exported == service_id {
            registration.close();
            false
        } else {
            true
        }
    });
}

#[async_trait]
impl EventListener<NodeDescriptor> for PromiscuousTopologyManager {
    async fn on_event(&self, event: NodeEvent<NodeDescriptor>) -> Result<()> {
        match event {
            NodeEvent::Added(descriptor) => self.discovered_node_added(descriptor).await,
            NodeEvent::Modified(descriptor) => self.discovered_node_modified(descriptor).await,
            NodeEvent::Removed(descriptor) => self.discovered_node_removed(&descriptor).await,
        }
        Ok(())
    }
}
