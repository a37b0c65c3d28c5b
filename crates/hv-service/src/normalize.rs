//! Template normalization
//!
//! Before a template reaches a host its isolation tag is scoped to the
//! tenant, its networks are tagged, its ISO and disk paths point at the
//! configured stores and its VLANs are reserved.

use labvisor_core::{HypervisorError, Result, VlanManager};
use labvisor_host::reconfigure::iso_path;
use labvisor_shared_types::{
    HypervisorServiceConfiguration, IsolationName, NetworkBackendType, VmTemplate,
};

/// Prefix `tag` with the tenant unless it already carries it.
pub fn apply_tenant(tag: &str, tenant: &str) -> String {
    if tenant.is_empty() || tag.starts_with(tenant) {
        tag.to_string()
    } else {
        format!("{}{}", tenant, tag)
    }
}

/// Move a `[store] folder/file` path onto `store`.
pub fn rewrite_store(path: &str, store: &str) -> String {
    if store.is_empty() || path.is_empty() {
        return path.to_string();
    }

    let rest = match path.strip_prefix('[').and_then(|p| p.split_once(']')) {
        Some((_, rest)) => rest.trim_start(),
        None => path.trim_start_matches('/'),
    };

    if store.ends_with(']') {
        format!("{} {}", store, rest)
    } else {
        format!("{}{}", store, rest)
    }
}

/// Normalize `template` in place. Running it twice changes nothing.
///
/// Networks are tagged with the isolation tag; a privileged template may
/// keep a shared network name when that network is already registered.
/// VLANs are reserved here for VLAN based backends; SDN segments carry no
/// VLAN.
pub fn normalize(
    template: &mut VmTemplate,
    privileged: bool,
    config: &HypervisorServiceConfiguration,
    vlans: &VlanManager,
) -> Result<()> {
    template
        .validate()
        .map_err(|e| HypervisorError::InvalidOperation(e.to_string()))?;

    template.isolation_tag = apply_tenant(&template.isolation_tag, &config.tenant);
    let tag = template.isolation_tag.clone();

    for eth in template.eth.iter_mut() {
        let shared = privileged && vlans.contains(&eth.net);
        if !shared {
            eth.net = eth.net.with_tag(&tag);
        }
    }

    template.iso = iso_path(&config.iso_store, &template.iso);
    for disk in template.disks.iter_mut() {
        disk.path = rewrite_store(&disk.path, &config.disk_store);
        disk.source = rewrite_store(&disk.source, &config.disk_store);
    }

    if config.network_backend != NetworkBackendType::Sdn {
        let use_uplink = template.use_uplink_switch;
        vlans.reserve(template, use_uplink)?;
    }

    Ok(())
}
