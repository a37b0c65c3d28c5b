//! Portgroups on a distributed vswitch
//!
//! Portgroup changes on a distributed switch are asynchronous tasks, and the
//! new portgroup key is only known once the inventory is read back.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use labvisor_core::{wait_for_task, Result, TaskWaitConfig, VimClient};
use labvisor_shared_types::{NetworkBackendType, PortGroupAllocation, Vlan, VmNet, VmNetwork};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::{read_vm_networks, reconfigure_nic};
use crate::backend::{BackendContext, NetworkBackend};

pub struct DistributedSwitchBackend {
    client: Arc<dyn VimClient>,
    switch: String,
    wait: TaskWaitConfig,
    cancel: CancellationToken,
}

impl DistributedSwitchBackend {
    pub fn new(context: &BackendContext) -> Self {
        Self {
            client: context.client.clone(),
            switch: context.config.uplink.clone(),
            wait: context.wait.clone(),
            cancel: context.cancel.clone(),
        }
    }

    async fn create_one(&self, switch: &str, vlan: &Vlan) -> Result<()> {
        let task = self
            .client
            .add_distributed_port_group(switch, &vlan.name, vlan.id)
            .await?;
        wait_for_task(self.client.as_ref(), &task, &self.wait, &self.cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl NetworkBackend for DistributedSwitchBackend {
    fn backend_type(&self) -> NetworkBackendType {
        NetworkBackendType::Distributed
    }

    fn uplink_switch(&self) -> String {
        self.switch.clone()
    }

    fn uses_local_switches(&self) -> bool {
        false
    }

    async fn load_port_groups(&self) -> Result<Vec<PortGroupAllocation>> {
        let records = self.client.list_port_groups().await?;
        Ok(records
            .into_iter()
            .filter(|pg| pg.switch == self.switch)
            .map(|pg| PortGroupAllocation::new(pg.name, pg.key, pg.vlan, pg.switch))
            .collect())
    }

    async fn add_port_groups(
        &self,
        switch: &str,
        vlans: &[Vlan],
    ) -> Result<Vec<PortGroupAllocation>> {
        let results = join_all(vlans.iter().map(|vlan| self.create_one(switch, vlan))).await;

        let mut fault = None;
        for (vlan, result) in vlans.iter().zip(results) {
            match result {
                Ok(()) => debug!("Added portgroup {} (vlan {}) to {}", vlan.name, vlan.id, switch),
                Err(e) if e.is_connection_fault() => fault = Some(e),
                Err(e) => warn!("Failed to add portgroup {} to {}: {}", vlan.name, switch, e),
            }
        }
        if let Some(e) = fault {
            return Err(e);
        }

        // Keys are assigned by the host; read them back.
        let existing = self.client.list_port_groups().await?;
        Ok(vlans
            .iter()
            .filter_map(|vlan| {
                existing
                    .iter()
                    .find(|pg| pg.name == vlan.name && pg.switch == switch)
                    .map(|pg| PortGroupAllocation::new(&pg.name, &pg.key, vlan.id, switch))
            })
            .collect())
    }

    async fn remove_port_group(&self, allocation: &PortGroupAllocation) -> Result<()> {
        let task = self
            .client
            .remove_distributed_port_group(&allocation.key)
            .await?;
        wait_for_task(self.client.as_ref(), &task, &self.wait, &self.cancel).await?;
        Ok(())
    }

    async fn add_switch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_switch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn get_vm_networks(&self, vm_reference: &str) -> Result<Vec<VmNetwork>> {
        read_vm_networks(self.client.as_ref(), vm_reference).await
    }

    async fn update_eth(&self, vm_reference: &str, eth: &VmNet) -> Result<()> {
        reconfigure_nic(self.client.as_ref(), &self.wait, &self.cancel, vm_reference, eth).await
    }
}
