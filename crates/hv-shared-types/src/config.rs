use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::{SharedResult, SharedTypeError};
use crate::network::NetworkBackendType;

/// Highest VLAN id addressable by the allocator bitmap.
pub const MAX_VLAN_ID: u16 = 4095;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorType {
    /// Client supplied by the embedding application
    Vsphere,
    /// In-memory simulated hosts
    #[default]
    Mock,
}

impl std::fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorType::Vsphere => write!(f, "vsphere"),
            HypervisorType::Mock => write!(f, "mock"),
        }
    }
}

/// Connection and placement settings for one host (or a host range).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HypervisorServiceConfiguration {
    #[serde(rename = "type")]
    pub hypervisor_type: HypervisorType,
    /// Endpoint URL; may contain a numeric range such as `esx[1-3]`
    pub url: String,
    /// Explicit host name, derived from `url` when empty
    pub host: String,
    pub username: String,
    pub password: String,
    pub pool_path: String,
    pub uplink: String,
    pub network_backend: NetworkBackendType,
    pub vm_store: String,
    pub disk_store: String,
    pub iso_store: String,
    pub tenant: String,
    pub exclude_network_mask: String,
    pub console_host: String,
    pub keep_alive_minutes: u64,
    pub cache_refresh_secs: u64,
    pub task_monitor_secs: u64,
    pub task_poll_secs: u64,
    pub task_timeout_minutes: u64,
    /// Idle networks younger than this are kept; negative sweeps at once
    pub clean_grace_secs: i64,
    pub host_affinity: bool,
    pub vlan: VlanConfiguration,
    pub sdn: SdnConfiguration,
}

impl Default for HypervisorServiceConfiguration {
    fn default() -> Self {
        Self {
            hypervisor_type: HypervisorType::default(),
            url: String::new(),
            host: String::new(),
            username: String::new(),
            password: String::new(),
            pool_path: String::new(),
            uplink: "vSwitch0".to_string(),
            network_backend: NetworkBackendType::default(),
            vm_store: "[datastore1] labvisor/".to_string(),
            disk_store: "[datastore1]".to_string(),
            iso_store: "[datastore1] iso/".to_string(),
            tenant: String::new(),
            exclude_network_mask: String::new(),
            console_host: String::new(),
            keep_alive_minutes: 10,
            cache_refresh_secs: 30,
            task_monitor_secs: 3,
            task_poll_secs: 2,
            task_timeout_minutes: 20,
            clean_grace_secs: 120,
            host_affinity: false,
            vlan: VlanConfiguration::default(),
            sdn: SdnConfiguration::default(),
        }
    }
}

impl HypervisorServiceConfiguration {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Host name used to label VMs and pick connections.
    pub fn host_name(&self) -> String {
        if !self.host.is_empty() {
            return self.host.clone();
        }

        let without_scheme = match self.url.find("://") {
            Some(idx) => &self.url[idx + 3..],
            None => self.url.as_str(),
        };

        without_scheme
            .split(|c: char| c == '/' || c == ':')
            .next()
            .unwrap_or(without_scheme)
            .to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() && self.host.is_empty() {
            bail!("Hypervisor url cannot be empty");
        }

        if self.network_backend == NetworkBackendType::Sdn && self.sdn.api_url.is_empty() {
            bail!("SDN network backend requires sdn.api_url");
        }

        if self.network_backend == NetworkBackendType::Host && self.uplink.is_empty() {
            bail!("Host network backend requires an uplink switch name");
        }

        self.vlan.parse_range()?;

        for reservation in &self.vlan.reservations {
            if reservation.id > MAX_VLAN_ID {
                bail!(
                    "VLAN reservation '{}' uses id {} outside 0-{}",
                    reservation.name,
                    reservation.id,
                    MAX_VLAN_ID
                );
            }
        }

        if !self.exclude_network_mask.is_empty() {
            if let Err(e) = regex::Regex::new(&self.exclude_network_mask) {
                bail!("Invalid exclude_network_mask: {}", e);
            }
        }

        if self.task_poll_secs == 0 || self.task_monitor_secs == 0 || self.cache_refresh_secs == 0 {
            bail!("Polling intervals must be greater than zero");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct VlanConfiguration {
    /// Usable uplink VLAN range, e.g. `"200-399"`; empty means the full range
    pub range: String,
    pub reservations: Vec<VlanReservation>,
}

impl VlanConfiguration {
    pub fn parse_range(&self) -> SharedResult<Option<(u16, u16)>> {
        let range = self.range.trim();
        if range.is_empty() {
            return Ok(None);
        }

        let (start, end) = range.split_once('-').ok_or_else(|| SharedTypeError::InvalidValue {
            field: "vlan.range",
            value: range.to_string(),
        })?;

        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|e| SharedTypeError::ParseError(format!("vlan.range '{}': {}", range, e)))
        };

        let (start, end) = (parse(start)?, parse(end)?);
        if start > end || end > MAX_VLAN_ID {
            return Err(SharedTypeError::InvalidValue {
                field: "vlan.range",
                value: range.to_string(),
            });
        }

        Ok(Some((start, end)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VlanReservation {
    pub id: u16,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SdnConfiguration {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub token: String,
    pub transport_zone: String,
    pub accept_invalid_certs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_name_from_url() {
        let config = HypervisorServiceConfiguration::new("https://esx1.lab.local/sdk");
        assert_eq!(config.host_name(), "esx1.lab.local");

        let config = HypervisorServiceConfiguration::new("esx2:443");
        assert_eq!(config.host_name(), "esx2");

        let mut config = HypervisorServiceConfiguration::new("https://vc/sdk");
        config.host = "cluster-a".to_string();
        assert_eq!(config.host_name(), "cluster-a");
    }

    #[test]
    fn test_vlan_range_parsing() {
        let mut vlan = VlanConfiguration::default();
        assert_eq!(vlan.parse_range().unwrap(), None);

        vlan.range = "200-399".to_string();
        assert_eq!(vlan.parse_range().unwrap(), Some((200, 399)));

        vlan.range = "400-200".to_string();
        assert!(vlan.parse_range().is_err());

        vlan.range = "1-5000".to_string();
        assert!(vlan.parse_range().is_err());

        vlan.range = "abc".to_string();
        assert!(vlan.parse_range().is_err());
    }

    #[test]
    fn test_configuration_validation() {
        let config = HypervisorServiceConfiguration::new("https://esx1/sdk");
        assert!(config.validate().is_ok());

        let mut config = HypervisorServiceConfiguration::new("https://esx1/sdk");
        config.network_backend = NetworkBackendType::Sdn;
        assert!(config.validate().is_err());

        let mut config = HypervisorServiceConfiguration::new("https://esx1/sdk");
        config.exclude_network_mask = "(".to_string();
        assert!(config.validate().is_err());

        let mut config = HypervisorServiceConfiguration::new("https://esx1/sdk");
        config.vlan.reservations.push(VlanReservation {
            id: 5000,
            name: "bad".to_string(),
        });
        assert!(config.validate().is_err());

        assert!(HypervisorServiceConfiguration::default().validate().is_err());
    }
}
