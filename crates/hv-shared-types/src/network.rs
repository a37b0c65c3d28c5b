use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SharedTypeError;
use crate::names::IsolationName;

/// One VLAN tag bound to a logical network name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vlan {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub on_uplink: bool,
}

impl Vlan {
    pub fn new(id: u16, name: impl Into<String>, on_uplink: bool) -> Self {
        Self {
            id,
            name: name.into(),
            on_uplink,
        }
    }
}

/// Host-side bookkeeping for one provisioned portgroup / segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortGroupAllocation {
    pub net: String,
    pub key: String,
    pub counter: i32,
    pub vlan_id: u16,
    pub switch: String,
    pub timestamp: DateTime<Utc>,
}

impl PortGroupAllocation {
    pub fn new(net: impl Into<String>, key: impl Into<String>, vlan_id: u16, switch: impl Into<String>) -> Self {
        Self {
            net: net.into(),
            key: key.into(),
            counter: 0,
            vlan_id,
            switch: switch.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tag(&self) -> &str {
        self.net.tag()
    }
}

/// A VM-to-network association read back from a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmNetwork {
    pub vm_reference: String,
    pub net_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackendType {
    /// Portgroups on a standard host vswitch
    #[default]
    Host,
    /// Portgroups on a distributed vswitch
    Distributed,
    /// Segments on an SDN gateway
    Sdn,
}

impl std::fmt::Display for NetworkBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkBackendType::Host => write!(f, "host"),
            NetworkBackendType::Distributed => write!(f, "distributed"),
            NetworkBackendType::Sdn => write!(f, "sdn"),
        }
    }
}

impl std::str::FromStr for NetworkBackendType {
    type Err = SharedTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" | "vswitch" => Ok(NetworkBackendType::Host),
            "distributed" | "dvs" => Ok(NetworkBackendType::Distributed),
            "sdn" | "nsx" => Ok(NetworkBackendType::Sdn),
            _ => Err(SharedTypeError::Unsupported(s.to_string())),
        }
    }
}
