//! Human-facing configuration changes
//!
//! Callers send a feature name and a free-form value; this turns them into
//! a typed change the host connection knows how to apply.

use labvisor_core::{HypervisorError, Result};

const GUEST_INFO_PREFIX: &str = "guestinfo.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmChange {
    /// Mount an ISO, or eject with an empty path
    Iso(String),
    /// Move NIC `index` to network `net`
    Net { index: u32, net: String },
    /// Boot delay in seconds
    Boot(u32),
    /// Guest-visible annotation
    Guest { key: String, value: String },
}

impl VmChange {
    /// Parse a change request.
    ///
    /// * `iso`: datastore path or file name
    /// * `net` / `eth`: `network` for the first NIC, or `eth1:network`
    /// * `boot`: delay in seconds
    /// * `guest`: `key=value`, stored under the `guestinfo.` namespace
    pub fn parse(feature: &str, value: &str) -> Result<Self> {
        let invalid = || HypervisorError::InvalidChange {
            feature: format!("{}={}", feature, value),
        };
        let value = value.trim();

        match feature.trim().to_lowercase().as_str() {
            "iso" => Ok(VmChange::Iso(value.to_string())),
            "net" | "eth" => {
                let (index, net) = match value.split_once(':') {
                    Some((nic, net)) => {
                        let digits = nic.trim().trim_start_matches("eth");
                        let index = digits.parse::<u32>().map_err(|_| invalid())?;
                        (index, net.trim())
                    }
                    None => (0, value),
                };
                if net.is_empty() {
                    return Err(invalid());
                }
                Ok(VmChange::Net {
                    index,
                    net: net.to_string(),
                })
            }
            "boot" => value.parse::<u32>().map(VmChange::Boot).map_err(|_| invalid()),
            "guest" => {
                let (key, setting) = value.split_once('=').ok_or_else(invalid)?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(invalid());
                }
                let key = if key.starts_with(GUEST_INFO_PREFIX) {
                    key.to_string()
                } else {
                    format!("{}{}", GUEST_INFO_PREFIX, key)
                };
                Ok(VmChange::Guest {
                    key,
                    value: setting.trim().to_string(),
                })
            }
            _ => Err(HypervisorError::InvalidChange {
                feature: feature.to_string(),
            }),
        }
    }
}

/// Resolve an ISO selection onto the ISO store unless it already names a
/// datastore.
pub fn iso_path(iso_store: &str, value: &str) -> String {
    if value.is_empty() || value.starts_with('[') {
        value.to_string()
    } else {
        format!("{}{}", iso_store, value.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_feature() {
        assert_eq!(
            VmChange::parse("iso", "[iso] kali.iso").unwrap(),
            VmChange::Iso("[iso] kali.iso".to_string())
        );
        assert_eq!(
            VmChange::parse("net", "lan").unwrap(),
            VmChange::Net {
                index: 0,
                net: "lan".to_string()
            }
        );
        assert_eq!(
            VmChange::parse("eth", "eth2: dmz").unwrap(),
            VmChange::Net {
                index: 2,
                net: "dmz".to_string()
            }
        );
        assert_eq!(VmChange::parse("Boot", "15").unwrap(), VmChange::Boot(15));
        assert_eq!(
            VmChange::parse("guest", "flag=abc").unwrap(),
            VmChange::Guest {
                key: "guestinfo.flag".to_string(),
                value: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_changes() {
        for (feature, value) in [
            ("cpu", "4"),
            ("boot", "soon"),
            ("guest", "novalue"),
            ("net", "ethx:lan"),
            ("net", "1:"),
        ] {
            assert!(matches!(
                VmChange::parse(feature, value),
                Err(HypervisorError::InvalidChange { .. })
            ));
        }
    }

    #[test]
    fn test_iso_path() {
        assert_eq!(iso_path("[datastore1] iso/", "kali.iso"), "[datastore1] iso/kali.iso");
        assert_eq!(iso_path("[datastore1] iso/", "[other] a.iso"), "[other] a.iso");
        assert_eq!(iso_path("[datastore1] iso/", ""), "");
    }
}
