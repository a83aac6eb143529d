//! Export and import registrations
//!
//! INTENTION: A registration is the caller's handle on one export or import.
//! It owns at most one transport resource and releases it exactly once, no
//! matter how many callers race on `close`. A registration whose setup failed
//! owns nothing, starts closed and keeps the setup error for inspection.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;
use wiring_common::{log_debug, log_warn, Logger};

use super::{AdminEvent, RegistrationError};
use crate::endpoint::{NodeDescriptor, WiringReceiver, WiringSender};
use crate::events::EventBus;
use crate::transport::{ClientEndpointPool, ServerEndpointRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Active,
    Closed,
    /// Setup failed; behaves like `Closed` but carries the error
    Failed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Active => write!(f, "active"),
            RegistrationState::Closed => write!(f, "closed"),
            RegistrationState::Failed => write!(f, "failed"),
        }
    }
}

/// Registrations created through one admin, removed again as they close
#[derive(Default)]
pub(crate) struct OwnedRegistrations {
    pub(crate) exports: Mutex<HashMap<Uuid, Arc<ExportRegistration>>>,
    pub(crate) imports: Mutex<HashMap<Uuid, Arc<ImportRegistration>>>,
}

/// Shared bookkeeping of both registration kinds
struct Lifecycle {
    id: Uuid,
    /// Serializes `update` against `close`
    transition: Mutex<()>,
    closed: AtomicBool,
    error: Option<Arc<anyhow::Error>>,
    descriptor: RwLock<Option<NodeDescriptor>>,
}

impl Lifecycle {
    fn active(descriptor: NodeDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            transition: Mutex::new(()),
            closed: AtomicBool::new(false),
            error: None,
            descriptor: RwLock::new(Some(descriptor)),
        }
    }

    fn failed(descriptor: Option<NodeDescriptor>, error: anyhow::Error) -> Self {
        Self {
            id: Uuid::new_v4(),
            transition: Mutex::new(()),
            closed: AtomicBool::new(true),
            error: Some(Arc::new(error)),
            descriptor: RwLock::new(descriptor),
        }
    }

    /// True for exactly one caller
    fn begin_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn state(&self) -> RegistrationState {
        if self.error.is_some() {
            RegistrationState::Failed
        } else if self.is_closed() {
            RegistrationState::Closed
        } else {
            RegistrationState::Active
        }
    }

    fn check_update(
        &self,
        descriptor: &NodeDescriptor,
    ) -> Result<NodeDescriptor, RegistrationError> {
        if self.is_closed() {
            return Err(RegistrationError::IllegalState(format!(
                "registration {} is {}",
                self.id,
                self.state()
            )));
        }
        let current = self.descriptor.read().clone().ok_or(RegistrationError::Closed)?;
        if current.id() != descriptor.id() {
            return Err(RegistrationError::IllegalState(format!(
                "cannot change identity {} to {}",
                current.id(),
                descriptor.id()
            )));
        }
        Ok(current)
    }
}

pub(crate) struct ExportResources {
    pub(crate) receiver: Arc<dyn WiringReceiver>,
    pub(crate) registry: Arc<ServerEndpointRegistry>,
    pub(crate) endpoints: Arc<EventBus<NodeDescriptor>>,
    pub(crate) events: broadcast::Sender<AdminEvent>,
    pub(crate) owner: Weak<OwnedRegistrations>,
}

/// Handle on one locally exported receiver
pub struct ExportRegistration {
    lifecycle: Lifecycle,
    service_id: String,
    resources: Option<ExportResources>,
    logger: Arc<Logger>,
}

impl ExportRegistration {
    pub(crate) fn active(
        descriptor: NodeDescriptor,
        resources: ExportResources,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            service_id: descriptor.service_id().to_string(),
            lifecycle: Lifecycle::active(descriptor),
            resources: Some(resources),
            logger,
        }
    }

    pub(crate) fn failed(
        service_id: &str,
        descriptor: Option<NodeDescriptor>,
        error: anyhow::Error,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            service_id: service_id.to_string(),
            lifecycle: Lifecycle::failed(descriptor, error),
            resources: None,
            logger,
        }
    }

    pub fn id(&self) -> Uuid {
        self.lifecycle.id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The published descriptor while active
    pub fn reference(&self) -> Option<NodeDescriptor> {
        if self.lifecycle.is_closed() {
            return None;
        }
        self.lifecycle.descriptor.read().clone()
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.lifecycle.error.as_deref()
    }

    pub fn state(&self) -> RegistrationState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Re-publish under the same identity, e.g. after a url change
    pub fn update(&self, descriptor: NodeDescriptor) -> Result<(), RegistrationError> {
        let _transition = self.lifecycle.transition.lock();
        self.lifecycle.check_update(&descriptor)?;
        let resources = self.resources.as_ref().ok_or(RegistrationError::Closed)?;
        *self.lifecycle.descriptor.write() = Some(descriptor.clone());
        resources
            .registry
            .add_endpoint(&descriptor, resources.receiver.clone());
        resources
            .endpoints
            .modify(descriptor.clone())
            .map_err(|e| RegistrationError::IllegalState(e.to_string()))?;
        log_debug!(self.logger, "updated export {descriptor}");
        Ok(())
    }

    /// Release the export; returns true for the call that actually released it
    pub fn close(&self) -> bool {
        let _transition = self.lifecycle.transition.lock();
        if !self.lifecycle.begin_close() {
            return false;
        }
        let Some(resources) = &self.resources else {
            return false;
        };
        let descriptor = self.lifecycle.descriptor.read().clone();
        if let Some(descriptor) = descriptor {
            resources.registry.remove_endpoint(&descriptor);
            if let Err(e) = resources.endpoints.remove(descriptor.clone()) {
                log_warn!(self.logger, "withdrawing {descriptor}: {e}");
            }
            let _ = resources
                .events
                .send(AdminEvent::ExportUnregistration(descriptor.clone()));
            log_debug!(self.logger, "closed export {descriptor}");
        }
        if let Some(owner) = resources.owner.upgrade() {
            owner.exports.lock().remove(&self.lifecycle.id);
        }
        true
    }
}

impl fmt::Debug for ExportRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportRegistration")
            .field("id", &self.lifecycle.id)
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct ImportResources {
    pub(crate) pool: Arc<ClientEndpointPool>,
    pub(crate) sender: Arc<dyn WiringSender>,
    pub(crate) events: broadcast::Sender<AdminEvent>,
    pub(crate) owner: Weak<OwnedRegistrations>,
}

/// Handle on one imported remote endpoint
pub struct ImportRegistration {
    lifecycle: Lifecycle,
    resources: Option<ImportResources>,
    logger: Arc<Logger>,
}

impl ImportRegistration {
    pub(crate) fn active(
        descriptor: NodeDescriptor,
        resources: ImportResources,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::active(descriptor),
            resources: Some(resources),
            logger,
        }
    }

    pub(crate) fn failed(
        descriptor: NodeDescriptor,
        error: anyhow::Error,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::failed(Some(descriptor), error),
            resources: None,
            logger,
        }
    }

    pub fn id(&self) -> Uuid {
        self.lifecycle.id
    }

    /// The imported descriptor, also after close
    pub fn descriptor(&self) -> Option<NodeDescriptor> {
        self.lifecycle.descriptor.read().clone()
    }

    /// Sender for the remote endpoint while active
    pub fn reference(&self) -> Option<Arc<dyn WiringSender>> {
        if self.lifecycle.is_closed() {
            return None;
        }
        self.resources.as_ref().map(|r| r.sender.clone())
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.lifecycle.error.as_deref()
    }

    pub fn state(&self) -> RegistrationState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Follow the remote endpoint to a new url under the same identity
    pub fn update(&self, descriptor: NodeDescriptor) -> Result<(), RegistrationError> {
        let _transition = self.lifecycle.transition.lock();
        self.lifecycle.check_update(&descriptor)?;
        let resources = self.resources.as_ref().ok_or(RegistrationError::Closed)?;
        *self.lifecycle.descriptor.write() = Some(descriptor.clone());
        resources.pool.update_endpoint(&descriptor);
        log_debug!(self.logger, "updated import {descriptor}");
        Ok(())
    }

    /// Release the pooled client; returns true for the call that released it
    pub fn close(&self) -> bool {
        let _transition = self.lifecycle.transition.lock();
        if !self.lifecycle.begin_close() {
            return false;
        }
        let Some(resources) = &self.resources else {
            return false;
        };
        let descriptor = self.lifecycle.descriptor.read().clone();
        if let Some(descriptor) = descriptor {
            resources.pool.remove_endpoint(&descriptor);
            let _ = resources
                .events
                .send(AdminEvent::ImportUnregistration(descriptor.clone()));
            log_debug!(self.logger, "closed import {descriptor}");
        }
        if let Some(owner) = resources.owner.upgrade() {
            owner.imports.lock().remove(&self.lifecycle.id);
        }
        true
    }
}

impl fmt::Debug for ImportRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportRegistration")
            .field("id", &self.lifecycle.id)
            .field("descriptor", &self.descriptor())
            .field("state", &self.state())
            .finish()
    }
}
