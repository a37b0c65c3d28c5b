//! Portgroups on a standard host vswitch

use std::sync::Arc;

use async_trait::async_trait;
use labvisor_core::{Result, TaskWaitConfig, VimClient};
use labvisor_shared_types::{NetworkBackendType, PortGroupAllocation, Vlan, VmNet, VmNetwork};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::{read_vm_networks, reconfigure_nic};
use crate::backend::{BackendContext, NetworkBackend};

/// Creates one host portgroup per network. Networks that stay off the
/// uplink get a vswitch of their own per isolation tag.
pub struct HostSwitchBackend {
    client: Arc<dyn VimClient>,
    uplink: String,
    wait: TaskWaitConfig,
    cancel: CancellationToken,
}

impl HostSwitchBackend {
    pub fn new(context: &BackendContext) -> Self {
        Self {
            client: context.client.clone(),
            uplink: context.config.uplink.clone(),
            wait: context.wait.clone(),
            cancel: context.cancel.clone(),
        }
    }
}

#[async_trait]
impl NetworkBackend for HostSwitchBackend {
    fn backend_type(&self) -> NetworkBackendType {
        NetworkBackendType::Host
    }

    fn uplink_switch(&self) -> String {
        self.uplink.clone()
    }

    fn uses_local_switches(&self) -> bool {
        true
    }

    async fn load_port_groups(&self) -> Result<Vec<PortGroupAllocation>> {
        let records = self.client.list_port_groups().await?;
        Ok(records
            .into_iter()
            .map(|pg| PortGroupAllocation::new(pg.name, pg.key, pg.vlan, pg.switch))
            .collect())
    }

    async fn add_port_groups(
        &self,
        switch: &str,
        vlans: &[Vlan],
    ) -> Result<Vec<PortGroupAllocation>> {
        let mut confirmed = Vec::with_capacity(vlans.len());

        for vlan in vlans {
            match self.client.add_port_group(switch, &vlan.name, vlan.id).await {
                Ok(key) => {
                    debug!("Added portgroup {} (vlan {}) to {}", vlan.name, vlan.id, switch);
                    confirmed.push(PortGroupAllocation::new(&vlan.name, key, vlan.id, switch));
                }
                Err(e) if e.is_connection_fault() => return Err(e),
                Err(e) => warn!("Failed to add portgroup {} to {}: {}", vlan.name, switch, e),
            }
        }

        Ok(confirmed)
    }

    async fn remove_port_group(&self, allocation: &PortGroupAllocation) -> Result<()> {
        self.client.remove_port_group(&allocation.key).await
    }

    async fn add_switch(&self, name: &str) -> Result<()> {
        self.client.add_switch(name).await
    }

    async fn remove_switch(&self, name: &str) -> Result<()> {
        self.client.remove_switch(name).await
    }

    async fn get_vm_networks(&self, vm_reference: &str) -> Result<Vec<VmNetwork>> {
        read_vm_networks(self.client.as_ref(), vm_reference).await
    }

    async fn update_eth(&self, vm_reference: &str, eth: &VmNet) -> Result<()> {
        reconfigure_nic(self.client.as_ref(), &self.wait, &self.cancel, vm_reference, eth).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvisor_core::SimulatedHost;
    use labvisor_shared_types::HypervisorServiceConfiguration;

    async fn backend() -> (Arc<SimulatedHost>, HostSwitchBackend) {
        let host = Arc::new(SimulatedHost::new("esx1"));
        host.connect().await.unwrap();
        host.add_switch("vSwitch0").await.unwrap();

        let context = BackendContext {
            client: host.clone(),
            config: HypervisorServiceConfiguration::new("https://esx1/sdk"),
            wait: TaskWaitConfig::default(),
            cancel: CancellationToken::new(),
        };
        (host, HostSwitchBackend::new(&context))
    }

    #[tokio::test]
    async fn test_failed_portgroups_are_left_out() {
        let (_host, backend) = backend().await;
        let vlans = vec![Vlan::new(1, "corp#abc", true), Vlan::new(2, "lan#abc", true)];

        let confirmed = backend.add_port_groups("vSwitch0", &vlans).await.unwrap();
        assert_eq!(confirmed.len(), 2);
        assert_eq!(confirmed[0].key, "HostPortGroup-corp#abc");

        let missing_switch = backend
            .add_port_groups("vSwitch7", &[Vlan::new(3, "dmz#abc", false)])
            .await
            .unwrap();
        assert!(missing_switch.is_empty());
    }

    #[tokio::test]
    async fn test_connection_fault_is_surfaced() {
        let (host, backend) = backend().await;
        host.expire_session();

        let err = backend
            .add_port_groups("vSwitch0", &[Vlan::new(1, "corp#abc", true)])
            .await
            .unwrap_err();
        assert!(err.is_connection_fault());
    }
}
