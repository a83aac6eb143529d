// Public modules
pub mod admin;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod events;
pub mod node;
pub mod topology;
pub mod transport;

// Re-export the main types
pub use admin::{
    AdminEvent, ExportRegistration, HttpAdmin, HttpAdminFactory, ImportRegistration,
    RegistrationError, RegistrationState, WiringAdmin,
};
pub use config::{ConfigError, DiscoveryConfig, HttpAdminConfig, NodeConfig};
pub use discovery::{
    DirectoryDiscovery, DirectoryStore, EtcdStore, MemoryStore, NodeDiscovery, StoreError,
};
pub use endpoint::{
    EndpointId, Message, NodeDescriptor, WiringReceiver, WiringSender, HTTP_PROTOCOL,
};
pub use events::{EventBus, EventBusError, EventListener, NodeEvent, SubscriptionId};
pub use node::WiringNode;
pub use topology::PromiscuousTopologyManager;
pub use transport::{ClientEndpointPool, ServerEndpointRegistry, TransportError};

// Re-export logging types for convenience
pub use wiring_common::{LogLevel, LoggingConfig};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
