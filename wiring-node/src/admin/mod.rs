// Wiring admin
//
// An admin turns local receivers into exported HTTP endpoints and remote
// descriptors into senders. Every export and import is tracked as a
// registration owned by the admin instance that created it; stopping the
// instance closes whatever it still owns.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::endpoint::{NodeDescriptor, WiringReceiver};

pub mod factory;
pub mod registration;

pub use factory::{HttpAdmin, HttpAdminFactory};
pub use registration::{ExportRegistration, ImportRegistration, RegistrationState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("registration is closed")]
    Closed,
}

/// Notifications about registrations and endpoint health
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminEvent {
    ExportRegistration(NodeDescriptor),
    ExportUnregistration(NodeDescriptor),
    ExportWarning { service_id: String, message: String },
    ExportError { service_id: String, message: String },
    ImportRegistration(NodeDescriptor),
    ImportUnregistration(NodeDescriptor),
    ImportWarning { descriptor: NodeDescriptor, message: String },
    ImportError { descriptor: NodeDescriptor, message: String },
}

#[async_trait]
pub trait WiringAdmin: Send + Sync {
    /// Identifier of this admin instance
    fn id(&self) -> &str;

    /// Export a receiver; failures are carried by the returned registration
    async fn export_endpoint(
        &self,
        receiver: Arc<dyn WiringReceiver>,
        service_id: &str,
    ) -> Arc<ExportRegistration>;

    /// Import a remote endpoint; failures are carried by the returned registration
    async fn import_endpoint(&self, descriptor: &NodeDescriptor) -> Arc<ImportRegistration>;

    fn exported_endpoints(&self) -> Vec<Arc<ExportRegistration>>;

    fn imported_endpoints(&self) -> Vec<Arc<ImportRegistration>>;

    /// Close every registration this instance still owns
    async fn stop(&self);
}
