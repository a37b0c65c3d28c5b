//! Network manager
//!
//! Owns the allocation table for one host and drives a [`NetworkBackend`]
//! to create and garbage-collect the networks VMs are attached to. Every
//! mutation of counters, timestamps and switch references happens under
//! the table lock, including the remote calls that back it.

use std::sync::Arc;

use chrono::{Duration, Utc};
use labvisor_core::{HypervisorError, Result, VlanManager, VmCache};
use labvisor_shared_types::{
    HypervisorServiceConfiguration, IsolationName, NetworkBackendType, PortGroupAllocation, Vlan,
    VmNet, VmTemplate,
};
use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::Mutex;

use crate::allocation::AllocationTable;
use crate::backend::NetworkBackend;

/// Prefix of per-tag switches created when networks stay off the uplink.
const LOCAL_SWITCH_PREFIX: &str = "sw";

pub struct NetworkManager {
    host: String,
    backend: Arc<dyn NetworkBackend>,
    table: Mutex<AllocationTable>,
    vlans: Arc<VlanManager>,
    cache: VmCache,
    grace: Duration,
    exclude: Option<Regex>,
    tenant: String,
}

impl NetworkManager {
    pub fn new(
        backend: Arc<dyn NetworkBackend>,
        vlans: Arc<VlanManager>,
        cache: VmCache,
        config: &HypervisorServiceConfiguration,
    ) -> Result<Self> {
        let exclude = if config.exclude_network_mask.is_empty() {
            None
        } else {
            let regex = Regex::new(&config.exclude_network_mask).map_err(|e| {
                HypervisorError::configuration(format!("invalid exclude_network_mask: {}", e))
            })?;
            Some(regex)
        };

        Ok(Self {
            host: config.host_name(),
            backend,
            table: Mutex::new(AllocationTable::new()),
            vlans,
            cache,
            grace: Duration::seconds(config.clean_grace_secs),
            exclude,
            tenant: config.tenant.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn backend_type(&self) -> NetworkBackendType {
        self.backend.backend_type()
    }

    /// Whether a network found on the host belongs to this instance.
    pub fn is_managed(&self, net: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(net) {
                return false;
            }
        }
        self.tenant.is_empty() || !net.is_tagged() || net.tag().starts_with(&self.tenant)
    }

    /// Load the host's existing networks, register their VLANs and rebuild
    /// attachment counters from the cached VMs of this host.
    pub async fn initialize(&self) -> Result<()> {
        let loaded = self.backend.load_port_groups().await?;
        let uplink = self.backend.uplink_switch();
        let stale = Utc::now() - self.grace - Duration::minutes(1);

        let mut table = self.table.lock().await;
        table.clear();
        table.add_switch(&uplink);

        let mut discovered = Vec::new();
        for mut allocation in loaded {
            if !self.is_managed(&allocation.net) {
                debug!("Skipping unmanaged network {}", allocation.net);
                continue;
            }
            allocation.counter = 0;
            allocation.timestamp = stale;
            discovered.push(Vlan::new(
                allocation.vlan_id,
                allocation.net.clone(),
                allocation.switch == uplink,
            ));
            table.insert(allocation);
        }
        self.vlans.activate(&discovered);

        let vms = self.cache.values().await;
        for vm in vms.iter().filter(|vm| vm.host == self.host) {
            match self.backend.get_vm_networks(&vm.reference).await {
                Ok(networks) => {
                    for network in networks {
                        table.attach_key(&network.net_key);
                    }
                }
                Err(e) => debug!("Unable to read networks of {}: {}", vm.name, e),
            }
        }

        info!(
            "Loaded {} networks on {} ({} backend)",
            table.len(),
            self.host,
            self.backend.backend_type()
        );
        Ok(())
    }

    /// Make sure every network of `template` exists, write the host keys
    /// into its interfaces and count the attachments. On failure the VLANs
    /// reserved by this call are given back.
    pub async fn provision(&self, template: &mut VmTemplate) -> Result<()> {
        let use_uplink = template.use_uplink_switch;
        let mut table = self.table.lock().await;

        let mut reserved = Vec::new();
        let outcome = self
            .provision_template(&mut table, template, use_uplink, &mut reserved)
            .await;
        if outcome.is_err() {
            self.release_unallocated(&table, &reserved);
        }
        outcome
    }

    async fn provision_template(
        &self,
        table: &mut AllocationTable,
        template: &mut VmTemplate,
        use_uplink: bool,
        reserved: &mut Vec<String>,
    ) -> Result<()> {
        let mut wanted: Vec<Vlan> = Vec::new();
        for eth in &template.eth {
            if wanted.iter().any(|v| v.name == eth.net) {
                continue;
            }
            let (vlan, fresh) = self.vlan_for(eth, use_uplink)?;
            if fresh {
                reserved.push(vlan.name.clone());
            }
            wanted.push(vlan);
        }

        self.provision_locked(table, &wanted, use_uplink).await?;

        let now = Utc::now();
        for eth in template.eth.iter_mut() {
            eth.key = table
                .attach(&eth.net, now)
                .ok_or_else(|| HypervisorError::Provisioning {
                    missing: vec![eth.net.clone()],
                })?;
            if let Some(vlan) = self.vlans.find(&eth.net) {
                eth.vlan = vlan.id;
            }
        }

        Ok(())
    }

    /// Create whichever of `vlans` are not allocated yet, in one backend call.
    pub async fn provision_all(&self, vlans: &[Vlan], use_uplink: bool) -> Result<()> {
        let mut table = self.table.lock().await;
        self.provision_locked(&mut table, vlans, use_uplink).await
    }

    async fn provision_locked(
        &self,
        table: &mut AllocationTable,
        vlans: &[Vlan],
        use_uplink: bool,
    ) -> Result<()> {
        let missing: Vec<Vlan> = vlans
            .iter()
            .filter(|v| !table.contains(&v.name))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let uplink = self.backend.uplink_switch();
        let switch = self.select_switch(&missing, use_uplink);

        let mut created_switch = false;
        if !table.has_switch(&switch) {
            if switch != uplink {
                self.backend.add_switch(&switch).await?;
                created_switch = true;
                info!("Created switch {} on {}", switch, self.host);
            }
            table.add_switch(&switch);
        }

        let confirmed = match self.backend.add_port_groups(&switch, &missing).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                if created_switch {
                    self.discard_switch(table, &switch).await;
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut activated = Vec::new();
        for mut allocation in confirmed {
            allocation.counter = 0;
            allocation.timestamp = now;
            activated.push(Vlan::new(
                allocation.vlan_id,
                allocation.net.clone(),
                allocation.switch == uplink,
            ));
            table.insert(allocation);
        }
        self.vlans.activate(&activated);

        let unconfirmed: Vec<String> = missing
            .iter()
            .filter(|v| !table.contains(&v.name))
            .map(|v| v.name.clone())
            .collect();

        if !unconfirmed.is_empty() {
            warn!(
                "Networks not confirmed on {}: {}",
                self.host,
                unconfirmed.join(", ")
            );
            if created_switch {
                self.discard_switch(table, &switch).await;
            }
            return Err(HypervisorError::Provisioning {
                missing: unconfirmed,
            });
        }

        info!(
            "Provisioned {} networks on {} ({})",
            activated.len(),
            switch,
            self.host
        );
        Ok(())
    }

    fn select_switch(&self, vlans: &[Vlan], use_uplink: bool) -> String {
        if use_uplink || !self.backend.uses_local_switches() {
            return self.backend.uplink_switch();
        }
        match vlans.iter().map(|v| v.name.tag()).find(|t| !t.is_empty()) {
            Some(tag) => LOCAL_SWITCH_PREFIX.with_tag(tag),
            None => self.backend.uplink_switch(),
        }
    }

    async fn discard_switch(&self, table: &mut AllocationTable, switch: &str) {
        if table.drop_switch_if_empty(switch) {
            if let Err(e) = self.backend.remove_switch(switch).await {
                debug!("Failed to remove switch {}: {}", switch, e);
            }
        }
    }

    /// Registered VLAN for an interface, reserving one when the network is
    /// new and the backend is VLAN based. The flag tells whether this call
    /// made the reservation.
    fn vlan_for(&self, eth: &VmNet, use_uplink: bool) -> Result<(Vlan, bool)> {
        if let Some(vlan) = self.vlans.find(&eth.net) {
            return Ok((vlan, false));
        }
        if self.backend.backend_type() == NetworkBackendType::Sdn {
            return Ok((Vlan::new(eth.vlan, eth.net.clone(), use_uplink), false));
        }

        let mut single = VmTemplate::new(eth.net.untagged(), eth.net.tag());
        single.eth.push(eth.clone());
        self.vlans.reserve(&mut single, use_uplink)?;
        self.vlans
            .find(&eth.net)
            .map(|vlan| (vlan, true))
            .ok_or_else(|| HypervisorError::VlanExhausted {
                network: eth.net.clone(),
            })
    }

    /// Give back the VLANs of networks that never made it into the table.
    fn release_unallocated(&self, table: &AllocationTable, nets: &[String]) {
        for net in nets.iter().filter(|net| !table.contains(net)) {
            debug!("Releasing vlan of unprovisioned network {}", net);
            self.vlans.deactivate(net);
        }
    }

    /// Release the networks a VM was attached to. Nothing is deleted; the
    /// networks become cleanup candidates once the grace period passes.
    pub async fn unprovision(&self, vm_reference: &str) -> Result<()> {
        let networks = self.backend.get_vm_networks(vm_reference).await?;

        let mut table = self.table.lock().await;
        let now = Utc::now();
        for network in networks {
            if !table.detach_key(&network.net_key, now) {
                debug!("{} is attached to untracked network {}", vm_reference, network.net_key);
            }
        }
        Ok(())
    }

    /// Undo the attachments of interfaces whose VM was never created.
    pub async fn release(&self, eth: &[VmNet]) {
        let keys: Vec<String> = eth.iter().map(|nic| nic.key.clone()).collect();
        self.detach(&keys).await;
    }

    /// Count down attachments by network key, e.g. for a VM that vanished
    /// from the host.
    pub async fn detach(&self, keys: &[String]) {
        let mut table = self.table.lock().await;
        let now = Utc::now();
        for key in keys.iter().filter(|key| !key.is_empty()) {
            if !table.detach_key(key, now) {
                debug!("Untracked network key {}", key);
            }
        }
    }

    /// Remove idle tagged networks, optionally only those of one tag.
    /// Networks whose tag still has a VM in the cache are always kept.
    /// Returns the names of the removed networks.
    pub async fn clean(&self, tag: Option<&str>) -> Vec<String> {
        let cutoff = Utc::now() - self.grace;
        let live = self.cache.live_tags().await;

        let mut table = self.table.lock().await;
        let candidates: Vec<PortGroupAllocation> = table
            .candidates(tag, cutoff)
            .into_iter()
            .filter(|pg| !live.contains(pg.tag()))
            .collect();

        let mut removed = Vec::new();
        for allocation in candidates {
            if let Err(e) = self.backend.remove_port_group(&allocation).await {
                debug!("Failed to remove network {}: {}", allocation.net, e);
                continue;
            }

            if let Some(switch) = table.remove(&allocation.net) {
                if let Err(e) = self.backend.remove_switch(&switch).await {
                    debug!("Failed to remove switch {}: {}", switch, e);
                }
            }
            self.vlans.deactivate(&allocation.net);
            removed.push(allocation.net);
        }

        if !removed.is_empty() {
            info!("Removed {} networks from {}", removed.len(), self.host);
        }
        removed
    }

    /// Move one NIC of a VM onto `eth.net`, provisioning it if needed.
    pub async fn update_eth(&self, vm_reference: &str, eth: &mut VmNet, use_uplink: bool) -> Result<()> {
        let (vlan, fresh) = self.vlan_for(eth, use_uplink)?;

        let mut table = self.table.lock().await;
        if let Err(e) = self
            .provision_locked(&mut table, &[vlan.clone()], use_uplink)
            .await
        {
            if fresh {
                self.release_unallocated(&table, &[vlan.name.clone()]);
            }
            return Err(e);
        }

        let now = Utc::now();
        let previous = std::mem::take(&mut eth.key);
        eth.key = table
            .attach(&eth.net, now)
            .ok_or_else(|| HypervisorError::Provisioning {
                missing: vec![eth.net.clone()],
            })?;
        eth.vlan = vlan.id;

        if let Err(e) = self.backend.update_eth(vm_reference, eth).await {
            table.detach_key(&eth.key, now);
            eth.key = previous;
            return Err(e);
        }

        if !previous.is_empty() {
            table.detach_key(&previous, now);
        }
        Ok(())
    }

    pub async fn allocation(&self, net: &str) -> Option<PortGroupAllocation> {
        self.table.lock().await.get(net).cloned()
    }

    /// Snapshot of the table, sorted by network name.
    pub async fn allocations(&self) -> Vec<PortGroupAllocation> {
        let table = self.table.lock().await;
        let mut all: Vec<PortGroupAllocation> = table.values().cloned().collect();
        all.sort_by(|a, b| a.net.cmp(&b.net));
        all
    }

    pub async fn switch_count(&self, switch: &str) -> Option<i32> {
        self.table.lock().await.switch_count(switch)
    }

    pub async fn network_key(&self, net: &str) -> Option<String> {
        self.table.lock().await.get(net).map(|pg| pg.key.clone())
    }
}
