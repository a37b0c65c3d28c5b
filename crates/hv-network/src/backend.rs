//! Network backend abstraction

use std::sync::Arc;

use async_trait::async_trait;
use labvisor_core::{Result, TaskWaitConfig, VimClient};
use labvisor_shared_types::{
    HypervisorServiceConfiguration, NetworkBackendType, PortGroupAllocation, Vlan, VmNet,
    VmNetwork,
};
use tokio_util::sync::CancellationToken;

/// Backend-specific remote network operations. The allocation logic in
/// [`crate::NetworkManager`] is shared by every backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    fn backend_type(&self) -> NetworkBackendType;

    /// Switch carrying uplink-bound networks.
    fn uplink_switch(&self) -> String;

    /// Whether non-uplink networks get a switch of their own per tag.
    fn uses_local_switches(&self) -> bool;

    async fn load_port_groups(&self) -> Result<Vec<PortGroupAllocation>>;

    /// Create networks on `switch`. Returns the allocations that were
    /// confirmed; entries that failed are simply absent.
    async fn add_port_groups(
        &self,
        switch: &str,
        vlans: &[Vlan],
    ) -> Result<Vec<PortGroupAllocation>>;

    async fn remove_port_group(&self, allocation: &PortGroupAllocation) -> Result<()>;

    async fn add_switch(&self, name: &str) -> Result<()>;

    async fn remove_switch(&self, name: &str) -> Result<()>;

    async fn get_vm_networks(&self, vm_reference: &str) -> Result<Vec<VmNetwork>>;

    /// Point a virtual NIC at `eth.key`.
    async fn update_eth(&self, vm_reference: &str, eth: &VmNet) -> Result<()>;
}

/// Everything a backend constructor may need.
#[derive(Clone)]
pub struct BackendContext {
    pub client: Arc<dyn VimClient>,
    pub config: HypervisorServiceConfiguration,
    pub wait: TaskWaitConfig,
    pub cancel: CancellationToken,
}
