//! Labvisor Service
//!
//! Orchestration over a pool of virtualization hosts: host range expansion,
//! placement by isolation tag, template normalization, batch deployment
//! and routing of VM operations to the owning host.

pub mod affinity;
pub mod config;
pub mod connector;
pub mod hosts;
pub mod normalize;
mod queue;
pub mod service;


pub use config::{ConfigError, LabvisorConfig};
pub use connector::{ClientConnector, ClientRegistry};
pub use queue::{batch_networks, disambiguate, random_prefix};
pub use labvisor_network::NetworkBackendFactory;
pub use service::HypervisorService;
