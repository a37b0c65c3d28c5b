use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::names::IsolationName;
use crate::vm::VmKeyValue;

/// Abstract description of a VM to deploy.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct VmTemplate {
    pub id: String,
    pub name: String,
    pub isolation_tag: String,
    pub iso: String,
    pub cpu: u32,
    pub ram: u32,
    pub delay: u32,
    pub eth: Vec<VmNet>,
    pub disks: Vec<VmDisk>,
    pub guest_settings: Vec<VmKeyValue>,
    pub use_uplink_switch: bool,
    pub auto_start: bool,
    pub host_affinity: bool,
}

impl VmTemplate {
    pub fn new(name: impl Into<String>, isolation_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolation_tag: isolation_tag.into(),
            cpu: 1,
            ram: 1024,
            ..Default::default()
        }
    }

    pub fn with_network(mut self, net: impl Into<String>) -> Self {
        let id = self.eth.len() as u32;
        self.eth.push(VmNet::new(id, net));
        self
    }

    pub fn with_disk(mut self, path: impl Into<String>) -> Self {
        self.disks.push(VmDisk::new(path));
        self
    }

    /// VM name as it appears on the host, `name#tag`.
    pub fn tagged_name(&self) -> String {
        self.name.with_tag(&self.isolation_tag)
    }

    /// Distinct network names referenced by the template's interfaces.
    pub fn networks(&self) -> Vec<String> {
        let mut nets: Vec<String> = Vec::new();
        for eth in &self.eth {
            if !nets.contains(&eth.net) {
                nets.push(eth.net.clone());
            }
        }
        nets
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("Template name cannot be empty");
        }

        if self.name.is_tagged() {
            bail!("Template name '{}' must not carry an isolation tag", self.name);
        }

        for eth in &self.eth {
            if eth.net.is_empty() {
                bail!("Template '{}' has an interface without a network", self.name);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct VmNet {
    pub id: u32,
    pub net: String,
    /// Host-specific network reference, filled in at provisioning time
    pub key: String,
    pub mac: String,
    pub ip: String,
    pub vlan: u16,
    #[serde(rename = "type")]
    pub adapter: String,
}

impl VmNet {
    pub fn new(id: u32, net: impl Into<String>) -> Self {
        Self {
            id,
            net: net.into(),
            adapter: "e1000".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct VmDisk {
    pub path: String,
    /// Stock disk to clone from when `path` does not exist yet
    pub source: String,
    pub controller: String,
    pub size: u32,
}

impl VmDisk {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            controller: "lsilogic".to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_networks_are_distinct() {
        let template = VmTemplate::new("db", "abc123")
            .with_network("corp")
            .with_network("lan")
            .with_network("corp");

        assert_eq!(template.networks(), vec!["corp", "lan"]);
        assert_eq!(template.eth[2].id, 2);
        assert_eq!(template.tagged_name(), "db#abc123");
    }

    #[test]
    fn test_template_validation() {
        assert!(VmTemplate::new("db", "abc").validate().is_ok());
        assert!(VmTemplate::new("", "abc").validate().is_err());
        assert!(VmTemplate::new("db#x", "abc").validate().is_err());
        assert!(VmTemplate::new("db", "abc").with_network("").validate().is_err());
    }
}
