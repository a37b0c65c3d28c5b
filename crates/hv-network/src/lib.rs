//! Labvisor Network
//!
//! Portgroup allocation bookkeeping and the network backend drivers that
//! create and destroy virtual networks on a host.

pub mod allocation;
pub mod backend;
pub mod drivers;
pub mod factory;
pub mod manager;

#[cfg(test)]
mod tests;

pub use allocation::AllocationTable;
pub use backend::{BackendContext, NetworkBackend};
pub use drivers::{DistributedSwitchBackend, HostSwitchBackend, SdnGatewayBackend};
pub use factory::NetworkBackendFactory;
pub use manager::NetworkManager;
