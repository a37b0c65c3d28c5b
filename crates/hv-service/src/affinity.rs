//! Host placement
//!
//! All VMs of an isolation tag run on the same host. The first placement
//! of a tag picks the host with the fewest VMs and is remembered until the
//! tag has no VMs left.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use labvisor_shared_types::{IsolationName, Vm};
use log::debug;
use rand::seq::SliceRandom;

#[derive(Debug, Default)]
pub struct HostAffinity {
    assignments: Mutex<HashMap<String, String>>,
}

impl HostAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.assignments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, tag: &str) -> Option<String> {
        self.lock().get(tag).cloned()
    }

    pub fn assign(&self, tag: &str, host: &str) {
        self.lock().insert(tag.to_string(), host.to_string());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget tags without VMs and tags pinned to hosts no longer in the
    /// pool. Returns how many were dropped.
    pub fn prune(&self, live_tags: &HashSet<String>, hosts: &[String]) -> usize {
        let mut assignments = self.lock();
        let before = assignments.len();
        assignments.retain(|tag, host| live_tags.contains(tag) && hosts.contains(host));
        let dropped = before - assignments.len();
        if dropped > 0 {
            debug!("Dropped {} stale affinity entries", dropped);
        }
        dropped
    }
}

/// Host of any cached VM already carrying `tag`.
pub fn find_host_by_affinity(tag: &str, vms: &[Vm]) -> Option<String> {
    vms.iter()
        .find(|vm| vm.name.tag() == tag)
        .map(|vm| vm.host.clone())
}

/// Host running the fewest VMs. Ties are broken at random.
pub fn find_host_by_fewest_vms(hosts: &[String], counts: &HashMap<String, usize>) -> Option<String> {
    let fewest = hosts
        .iter()
        .map(|h| counts.get(h).copied().unwrap_or(0))
        .min()?;

    let tied: Vec<String> = hosts
        .iter()
        .filter(|h| counts.get(*h).copied().unwrap_or(0) == fewest)
        .cloned()
        .collect();

    match tied.len() {
        1 => tied.into_iter().next(),
        _ => find_host_by_random(&tied),
    }
}

pub fn find_host_by_random(hosts: &[String]) -> Option<String> {
    hosts.choose(&mut rand::thread_rng()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, host: &str) -> Vm {
        Vm {
            id: format!("{}-{}", host, name),
            name: name.to_string(),
            host: host.to_string(),
            ..Default::default()
        }
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_affinity_follows_existing_vm() {
        let vms = vec![vm("db#abc", "esx2"), vm("web#xyz", "esx1")];
        assert_eq!(find_host_by_affinity("abc", &vms).as_deref(), Some("esx2"));
        assert_eq!(find_host_by_affinity("new", &vms), None);
    }

    #[test]
    fn test_fewest_vms_wins() {
        let counts = HashMap::from([("esx1".to_string(), 4), ("esx2".to_string(), 1)]);
        assert_eq!(
            find_host_by_fewest_vms(&hosts(&["esx1", "esx2", "esx3"]), &counts).as_deref(),
            Some("esx3")
        );
        assert_eq!(
            find_host_by_fewest_vms(&hosts(&["esx1", "esx2"]), &counts).as_deref(),
            Some("esx2")
        );
    }

    #[test]
    fn test_tie_picks_one_of_the_tied() {
        let counts = HashMap::from([("esx1".to_string(), 2)]);
        let pick = find_host_by_fewest_vms(&hosts(&["esx1", "esx2", "esx3"]), &counts).unwrap();
        assert!(pick == "esx2" || pick == "esx3");
        assert_eq!(find_host_by_fewest_vms(&[], &counts), None);
    }

    #[test]
    fn test_prune_drops_dead_tags_and_hosts() {
        let affinity = HostAffinity::new();
        affinity.assign("abc", "esx1");
        affinity.assign("gone", "esx1");
        affinity.assign("moved", "esx9");

        let live: HashSet<String> = ["abc", "moved"].iter().map(|s| s.to_string()).collect();
        assert_eq!(affinity.prune(&live, &hosts(&["esx1", "esx2"])), 2);
        assert_eq!(affinity.get("abc").as_deref(), Some("esx1"));
        assert_eq!(affinity.len(), 1);
    }
}
