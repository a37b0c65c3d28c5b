//! Network backend drivers

pub mod distributed;
pub mod host_switch;
pub mod sdn_gateway;

pub use distributed::DistributedSwitchBackend;
pub use host_switch::HostSwitchBackend;
pub use sdn_gateway::SdnGatewayBackend;

use labvisor_core::{wait_for_task, DeviceChange, Result, TaskWaitConfig, VimClient};
use labvisor_shared_types::{VmNet, VmNetwork};
use tokio_util::sync::CancellationToken;

/// Repoint NIC `eth.id` of a VM at `eth.key` and wait for the host.
pub(crate) async fn reconfigure_nic(
    client: &dyn VimClient,
    wait: &TaskWaitConfig,
    cancel: &CancellationToken,
    vm_reference: &str,
    eth: &VmNet,
) -> Result<()> {
    let change = DeviceChange::Network {
        index: eth.id,
        net_key: eth.key.clone(),
    };
    let task = client.reconfigure_vm(vm_reference, &change).await?;
    wait_for_task(client, &task, wait, cancel).await?;
    Ok(())
}

pub(crate) async fn read_vm_networks(
    client: &dyn VimClient,
    vm_reference: &str,
) -> Result<Vec<VmNetwork>> {
    let keys = client.vm_network_keys(vm_reference).await?;
    Ok(keys
        .into_iter()
        .filter(|key| !key.is_empty())
        .map(|net_key| VmNetwork {
            vm_reference: vm_reference.to_string(),
            net_key,
        })
        .collect())
}
