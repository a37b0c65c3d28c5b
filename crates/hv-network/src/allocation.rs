//! Portgroup and switch bookkeeping
//!
//! Plain data structure; the owner wraps it in a lock so counters and
//! timestamps always change together.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use labvisor_shared_types::{IsolationName, PortGroupAllocation};

#[derive(Debug, Default)]
pub struct AllocationTable {
    port_groups: HashMap<String, PortGroupAllocation>,
    switches: HashMap<String, i32>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.port_groups.clear();
        self.switches.clear();
    }

    pub fn len(&self) -> usize {
        self.port_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.port_groups.is_empty()
    }

    pub fn contains(&self, net: &str) -> bool {
        self.port_groups.contains_key(net)
    }

    pub fn get(&self, net: &str) -> Option<&PortGroupAllocation> {
        self.port_groups.get(net)
    }

    pub fn values(&self) -> impl Iterator<Item = &PortGroupAllocation> {
        self.port_groups.values()
    }

    /// Track a portgroup and count it against its switch.
    pub fn insert(&mut self, allocation: PortGroupAllocation) {
        if let Some(previous) = self.port_groups.remove(&allocation.net) {
            self.release_switch(&previous.switch);
        }
        *self.switches.entry(allocation.switch.clone()).or_insert(0) += 1;
        self.port_groups.insert(allocation.net.clone(), allocation);
    }

    /// Register a switch with no portgroups yet. Returns false if known.
    pub fn add_switch(&mut self, name: &str) -> bool {
        if self.switches.contains_key(name) {
            return false;
        }
        self.switches.insert(name.to_string(), 0);
        true
    }

    pub fn has_switch(&self, name: &str) -> bool {
        self.switches.contains_key(name)
    }

    pub fn switch_count(&self, name: &str) -> Option<i32> {
        self.switches.get(name).copied()
    }

    /// Count one more VM attachment on `net`.
    pub fn attach(&mut self, net: &str, now: DateTime<Utc>) -> Option<String> {
        self.port_groups.get_mut(net).map(|pg| {
            pg.counter += 1;
            pg.timestamp = now;
            pg.key.clone()
        })
    }

    pub fn attach_key(&mut self, key: &str) -> bool {
        match self.port_groups.values_mut().find(|pg| pg.key == key) {
            Some(pg) => {
                pg.counter += 1;
                true
            }
            None => false,
        }
    }

    /// Count one VM attachment less and mark the network as a cleanup
    /// candidate from `now` on.
    pub fn detach_key(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        match self.port_groups.values_mut().find(|pg| pg.key == key) {
            Some(pg) => {
                pg.counter = (pg.counter - 1).max(0);
                pg.timestamp = now;
                true
            }
            None => false,
        }
    }

    /// Idle tagged networks last touched before `cutoff`, oldest first.
    /// With a tag, only that tag's networks are considered.
    pub fn candidates(&self, tag: Option<&str>, cutoff: DateTime<Utc>) -> Vec<PortGroupAllocation> {
        let mut found: Vec<PortGroupAllocation> = self
            .port_groups
            .values()
            .filter(|pg| match tag {
                Some(tag) => pg.net.tag() == tag,
                None => true,
            })
            .filter(|pg| pg.net.is_tagged() && pg.counter < 1 && pg.timestamp < cutoff)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        found
    }

    /// Drop a portgroup. Returns the switch name when that leaves a tagged
    /// switch with no portgroups, so the caller can delete it.
    pub fn remove(&mut self, net: &str) -> Option<String> {
        let removed = self.port_groups.remove(net)?;
        self.release_switch(&removed.switch)
    }

    fn release_switch(&mut self, switch: &str) -> Option<String> {
        let count = self.switches.get_mut(switch)?;
        *count -= 1;
        if *count <= 0 && switch.is_tagged() {
            self.switches.remove(switch);
            return Some(switch.to_string());
        }
        None
    }

    /// Forget an empty switch whose creation could not be completed.
    pub fn drop_switch_if_empty(&mut self, name: &str) -> bool {
        if self.switches.get(name) == Some(&0) {
            self.switches.remove(name);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pg(net: &str, key: &str, switch: &str) -> PortGroupAllocation {
        PortGroupAllocation::new(net, key, 10, switch)
    }

    #[test]
    fn test_switch_reference_counting() {
        let mut table = AllocationTable::new();
        assert!(table.add_switch("sw#abc"));
        assert!(!table.add_switch("sw#abc"));

        table.insert(pg("a#abc", "k1", "sw#abc"));
        table.insert(pg("b#abc", "k2", "sw#abc"));
        assert_eq!(table.switch_count("sw#abc"), Some(2));

        assert_eq!(table.remove("a#abc"), None);
        assert_eq!(table.remove("b#abc"), Some("sw#abc".to_string()));
        assert!(!table.has_switch("sw#abc"));
    }

    #[test]
    fn test_untagged_switch_is_kept() {
        let mut table = AllocationTable::new();
        table.insert(pg("a#abc", "k1", "vSwitch0"));
        assert_eq!(table.remove("a#abc"), None);
        assert_eq!(table.switch_count("vSwitch0"), Some(0));
    }

    #[test]
    fn test_attach_and_detach() {
        let mut table = AllocationTable::new();
        table.insert(pg("a#abc", "k1", "vSwitch0"));
        let now = Utc::now();

        assert_eq!(table.attach("a#abc", now), Some("k1".to_string()));
        assert!(table.attach_key("k1"));
        assert_eq!(table.get("a#abc").unwrap().counter, 2);

        assert!(table.detach_key("k1", now));
        assert!(table.detach_key("k1", now));
        assert!(table.detach_key("k1", now));
        assert_eq!(table.get("a#abc").unwrap().counter, 0);
        assert!(!table.detach_key("missing", now));
    }

    #[test]
    fn test_candidates_filter_and_order() {
        let mut table = AllocationTable::new();
        let now = Utc::now();

        let mut old = pg("old#abc", "k1", "vSwitch0");
        old.timestamp = now - Duration::minutes(30);
        let mut older = pg("older#xyz", "k2", "vSwitch0");
        older.timestamp = now - Duration::minutes(60);
        let mut fresh = pg("fresh#abc", "k3", "vSwitch0");
        fresh.timestamp = now;
        let mut shared = pg("shared", "k4", "vSwitch0");
        shared.timestamp = now - Duration::minutes(60);
        let mut busy = pg("busy#abc", "k5", "vSwitch0");
        busy.timestamp = now - Duration::minutes(60);
        busy.counter = 1;

        for p in [old, older, fresh, shared, busy] {
            table.insert(p);
        }

        let cutoff = now - Duration::minutes(2);
        let all: Vec<String> = table
            .candidates(None, cutoff)
            .into_iter()
            .map(|p| p.net)
            .collect();
        assert_eq!(all, vec!["older#xyz", "old#abc"]);

        let tagged: Vec<String> = table
            .candidates(Some("abc"), cutoff)
            .into_iter()
            .map(|p| p.net)
            .collect();
        assert_eq!(tagged, vec!["old#abc"]);
    }
}
