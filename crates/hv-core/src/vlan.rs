//! VLAN allocation
//!
//! Maps logical network names to VLAN ids. Uplink-bound networks draw their
//! id from a 4096-bit bitmap shared by the whole host pool; networks on a
//! per-lab local switch get an id that is only unique within their tag.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use labvisor_shared_types::config::MAX_VLAN_ID;
use labvisor_shared_types::{IsolationName, Vlan, VlanConfiguration, VmTemplate};
use log::{debug, info};

use crate::error::HypervisorError;
use crate::Result;

const VLAN_COUNT: usize = MAX_VLAN_ID as usize + 1;
const WORD_BITS: usize = 64;

/// Host-local ids start above this value.
const LOCAL_VLAN_FLOOR: u16 = 100;

/// Fixed-size bit vector, one bit per VLAN id. A set bit means reserved.
#[derive(Debug, Clone)]
struct VlanBitmap {
    words: [u64; VLAN_COUNT / WORD_BITS],
}

impl VlanBitmap {
    fn new() -> Self {
        Self {
            words: [0; VLAN_COUNT / WORD_BITS],
        }
    }

    fn get(&self, id: u16) -> bool {
        let id = id as usize;
        self.words[id / WORD_BITS] & (1 << (id % WORD_BITS)) != 0
    }

    fn set(&mut self, id: u16) {
        let id = id as usize;
        self.words[id / WORD_BITS] |= 1 << (id % WORD_BITS);
    }

    fn clear(&mut self, id: u16) {
        let id = id as usize;
        self.words[id / WORD_BITS] &= !(1 << (id % WORD_BITS));
    }

    fn first_clear(&self) -> Option<u16> {
        self.words.iter().enumerate().find_map(|(i, word)| {
            if *word == u64::MAX {
                None
            } else {
                Some((i * WORD_BITS + word.trailing_ones() as usize) as u16)
            }
        })
    }

    fn count_clear(&self) -> usize {
        self.words.iter().map(|w| w.count_zeros() as usize).sum()
    }
}

/// Bitmap and name map are only ever touched together.
#[derive(Debug)]
struct VlanTable {
    bitmap: VlanBitmap,
    vlans: HashMap<String, Vlan>,
}

/// Registry of VLAN ids in use across the host pool.
#[derive(Debug)]
pub struct VlanManager {
    table: Mutex<VlanTable>,
}

impl VlanManager {
    /// Build the allocator from configuration. Id 0 is never handed out;
    /// ids outside the configured range and static reservations are marked
    /// reserved up front.
    pub fn new(config: &VlanConfiguration) -> Result<Self> {
        let mut bitmap = VlanBitmap::new();
        bitmap.set(0);

        let range = config
            .parse_range()
            .map_err(|e| HypervisorError::configuration(e.to_string()))?;

        if let Some((start, end)) = range {
            for id in 0..=MAX_VLAN_ID {
                if id < start || id > end {
                    bitmap.set(id);
                }
            }
        }

        let mut vlans = HashMap::new();
        for reservation in &config.reservations {
            if reservation.id > MAX_VLAN_ID {
                return Err(HypervisorError::configuration(format!(
                    "VLAN reservation {} is out of range",
                    reservation.id
                )));
            }
            bitmap.set(reservation.id);
            vlans.insert(
                reservation.name.clone(),
                Vlan::new(reservation.id, reservation.name.clone(), true),
            );
        }

        Ok(Self {
            table: Mutex::new(VlanTable { bitmap, vlans }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VlanTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Assign a VLAN id to every interface of the template. Names already
    /// registered keep their id. On failure nothing reserved by this call
    /// stays reserved.
    pub fn reserve(&self, template: &mut VmTemplate, use_uplink: bool) -> Result<()> {
        let mut table = self.lock();
        let mut added: Vec<String> = Vec::new();

        for eth in template.eth.iter_mut() {
            if let Some(vlan) = table.vlans.get(&eth.net) {
                eth.vlan = vlan.id;
                continue;
            }

            let allocated = if use_uplink {
                table.bitmap.first_clear().map(|id| {
                    table.bitmap.set(id);
                    Vlan::new(id, eth.net.clone(), true)
                })
            } else {
                let tag = eth.net.tag().to_string();
                let highest = table
                    .vlans
                    .values()
                    .filter(|v| !v.on_uplink && v.name.tag() == tag)
                    .map(|v| v.id)
                    .max()
                    .unwrap_or(LOCAL_VLAN_FLOOR)
                    .max(LOCAL_VLAN_FLOOR);

                (highest < MAX_VLAN_ID - 1).then(|| Vlan::new(highest + 1, eth.net.clone(), false))
            };

            match allocated {
                Some(vlan) => {
                    debug!("Reserved vlan {} for {}", vlan.id, vlan.name);
                    eth.vlan = vlan.id;
                    added.push(eth.net.clone());
                    table.vlans.insert(eth.net.clone(), vlan);
                }
                None => {
                    for name in added {
                        if let Some(vlan) = table.vlans.remove(&name) {
                            if vlan.on_uplink {
                                table.bitmap.clear(vlan.id);
                            }
                        }
                    }
                    return Err(HypervisorError::VlanExhausted {
                        network: eth.net.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Merge VLANs discovered on a host into the registry.
    pub fn activate(&self, vlans: &[Vlan]) {
        let mut table = self.lock();
        for vlan in vlans {
            if table.vlans.contains_key(&vlan.name) {
                continue;
            }
            if vlan.on_uplink && vlan.id <= MAX_VLAN_ID {
                table.bitmap.set(vlan.id);
            }
            table.vlans.insert(vlan.name.clone(), vlan.clone());
        }
        info!("Activated {} vlans", vlans.len());
    }

    /// Release a tagged network's VLAN. Shared (untagged) names are kept.
    pub fn deactivate(&self, name: &str) {
        if !name.is_tagged() {
            return;
        }

        let mut table = self.lock();
        if let Some(vlan) = table.vlans.remove(name) {
            if vlan.on_uplink {
                table.bitmap.clear(vlan.id);
            }
            debug!("Released vlan {} from {}", vlan.id, name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().vlans.contains_key(name)
    }

    pub fn find(&self, name: &str) -> Option<Vlan> {
        self.lock().vlans.get(name).cloned()
    }

    /// Shared networks plus the networks of one isolation tag, sorted.
    pub fn find_networks(&self, tag: &str) -> Vec<String> {
        let table = self.lock();
        let mut names: Vec<String> = table
            .vlans
            .keys()
            .filter(|name| !name.is_tagged() || name.tag() == tag)
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_reserved(&self, id: u16) -> bool {
        id <= MAX_VLAN_ID && self.lock().bitmap.get(id)
    }

    /// Uplink ids still free.
    pub fn available(&self) -> usize {
        self.lock().bitmap.count_clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvisor_shared_types::VlanReservation;

    fn manager() -> VlanManager {
        VlanManager::new(&VlanConfiguration::default()).unwrap()
    }

    #[test]
    fn test_first_uplink_reservation_gets_lowest_id() {
        let vlans = manager();
        let mut template = VmTemplate::new("db", "abc123").with_network("corp#abc123");

        vlans.reserve(&mut template, true).unwrap();

        assert_eq!(template.eth[0].vlan, 1);
        assert!(vlans.is_reserved(1));
        assert!(vlans.contains("corp#abc123"));
    }

    #[test]
    fn test_reservation_is_idempotent() {
        let vlans = manager();
        let mut first = VmTemplate::new("db", "abc").with_network("corp#abc");
        let mut second = VmTemplate::new("web", "abc").with_network("corp#abc");

        vlans.reserve(&mut first, true).unwrap();
        let free = vlans.available();
        vlans.reserve(&mut second, true).unwrap();

        assert_eq!(first.eth[0].vlan, second.eth[0].vlan);
        assert_eq!(vlans.available(), free);
    }

    #[test]
    fn test_uplink_exhaustion() {
        let config = VlanConfiguration {
            range: "10-11".to_string(),
            reservations: vec![],
        };
        let vlans = VlanManager::new(&config).unwrap();
        assert_eq!(vlans.available(), 2);

        let mut template = VmTemplate::new("db", "t")
            .with_network("a#t")
            .with_network("b#t");
        vlans.reserve(&mut template, true).unwrap();
        assert_eq!(template.eth[0].vlan, 10);
        assert_eq!(template.eth[1].vlan, 11);

        let mut overflow = VmTemplate::new("web", "u")
            .with_network("x#u")
            .with_network("y#u");
        let err = vlans.reserve(&mut overflow, true).unwrap_err();
        assert!(matches!(err, HypervisorError::VlanExhausted { .. }));
        assert!(!vlans.contains("x#u"));
    }

    #[test]
    fn test_failed_reservation_rolls_back() {
        let config = VlanConfiguration {
            range: "10-10".to_string(),
            reservations: vec![],
        };
        let vlans = VlanManager::new(&config).unwrap();

        let mut template = VmTemplate::new("db", "t")
            .with_network("a#t")
            .with_network("b#t");
        assert!(vlans.reserve(&mut template, true).is_err());

        assert!(!vlans.contains("a#t"));
        assert!(!vlans.is_reserved(10));
        assert_eq!(vlans.available(), 1);
    }

    #[test]
    fn test_local_ids_follow_tag_maximum() {
        let vlans = manager();
        let mut template = VmTemplate::new("db", "abc")
            .with_network("a#abc")
            .with_network("b#abc");
        vlans.reserve(&mut template, false).unwrap();

        assert_eq!(template.eth[0].vlan, LOCAL_VLAN_FLOOR + 1);
        assert_eq!(template.eth[1].vlan, LOCAL_VLAN_FLOOR + 2);
        assert!(!vlans.is_reserved(LOCAL_VLAN_FLOOR + 1));

        let mut other = VmTemplate::new("db", "xyz").with_network("a#xyz");
        vlans.reserve(&mut other, false).unwrap();
        assert_eq!(other.eth[0].vlan, LOCAL_VLAN_FLOOR + 1);
    }

    #[test]
    fn test_activate_and_deactivate() {
        let vlans = manager();
        vlans.activate(&[
            Vlan::new(20, "corp#abc", true),
            Vlan::new(30, "shared", true),
            Vlan::new(101, "lan#abc", false),
        ]);

        assert!(vlans.is_reserved(20));
        assert!(vlans.is_reserved(30));
        assert!(!vlans.is_reserved(101));

        vlans.deactivate("corp#abc");
        assert!(!vlans.is_reserved(20));
        assert!(!vlans.contains("corp#abc"));

        vlans.deactivate("shared");
        assert!(vlans.is_reserved(30));
        assert!(vlans.contains("shared"));
    }

    #[test]
    fn test_reservations_and_find_networks() {
        let config = VlanConfiguration {
            range: String::new(),
            reservations: vec![VlanReservation {
                id: 5,
                name: "bridge-net".to_string(),
            }],
        };
        let vlans = VlanManager::new(&config).unwrap();
        assert!(vlans.is_reserved(5));

        let mut template = VmTemplate::new("db", "abc")
            .with_network("lan#abc")
            .with_network("bridge-net");
        vlans.reserve(&mut template, true).unwrap();
        assert_eq!(template.eth[1].vlan, 5);

        let mut other = VmTemplate::new("db", "xyz").with_network("lan#xyz");
        vlans.reserve(&mut other, true).unwrap();

        assert_eq!(vlans.find_networks("abc"), vec!["bridge-net", "lan#abc"]);
        assert_eq!(vlans.find_networks("xyz"), vec!["bridge-net", "lan#xyz"]);
    }
}
