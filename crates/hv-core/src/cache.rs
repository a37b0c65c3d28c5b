//! Process-wide VM cache shared by every host connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use labvisor_shared_types::{IsolationName, Vm};
use tokio::sync::RwLock;

/// Changes applied by [`VmCache::reconcile`].
#[derive(Debug, Default, Clone)]
pub struct CacheDelta {
    /// New entries and entries whose state changed
    pub changed: Vec<Vm>,
    pub removed: Vec<Vm>,
}

impl CacheDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct VmCache {
    vms: Arc<RwLock<HashMap<String, Vm>>>,
}

impl VmCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Vm> {
        self.vms.read().await.get(id).cloned()
    }

    pub async fn insert(&self, vm: Vm) {
        self.vms.write().await.insert(vm.id.clone(), vm);
    }

    pub async fn remove(&self, id: &str) -> Option<Vm> {
        self.vms.write().await.remove(id)
    }

    /// Apply `f` to a cached entry, returning the updated copy.
    pub async fn update<F>(&self, id: &str, f: F) -> Option<Vm>
    where
        F: FnOnce(&mut Vm),
    {
        let mut guard = self.vms.write().await;
        guard.get_mut(id).map(|vm| {
            f(vm);
            vm.clone()
        })
    }

    pub async fn values(&self) -> Vec<Vm> {
        self.vms.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vms.read().await.is_empty()
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Vm> {
        self.vms
            .read()
            .await
            .values()
            .find(|vm| vm.name == name)
            .cloned()
    }

    /// Entries whose id or name contains `term`, sorted by name.
    pub async fn find(&self, term: &str) -> Vec<Vm> {
        let mut found: Vec<Vm> = self
            .vms
            .read()
            .await
            .values()
            .filter(|vm| term.is_empty() || vm.id.contains(term) || vm.name.contains(term))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub async fn with_tag(&self, tag: &str) -> Vec<Vm> {
        self.vms
            .read()
            .await
            .values()
            .filter(|vm| vm.name.tag() == tag)
            .cloned()
            .collect()
    }

    pub async fn has_tag(&self, tag: &str) -> bool {
        self.vms
            .read()
            .await
            .values()
            .any(|vm| vm.name.tag() == tag)
    }

    /// Tags that currently have at least one VM.
    pub async fn live_tags(&self) -> HashSet<String> {
        self.vms
            .read()
            .await
            .values()
            .filter(|vm| vm.name.is_tagged())
            .map(|vm| vm.name.tag().to_string())
            .collect()
    }

    pub async fn count_by_host(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for vm in self.vms.read().await.values() {
            *counts.entry(vm.host.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Replace everything cached for `host` with a fresh inventory. Entries
    /// missing from the inventory are dropped; an in-flight task recorded
    /// locally survives the refresh.
    pub async fn reconcile(&self, host: &str, inventory: Vec<Vm>) -> CacheDelta {
        let mut delta = CacheDelta::default();
        let mut guard = self.vms.write().await;

        let fresh: HashSet<String> = inventory.iter().map(|vm| vm.id.clone()).collect();
        let stale: Vec<String> = guard
            .values()
            .filter(|vm| vm.host == host && !fresh.contains(&vm.id))
            .map(|vm| vm.id.clone())
            .collect();

        for id in stale {
            if let Some(vm) = guard.remove(&id) {
                delta.removed.push(vm);
            }
        }

        for mut vm in inventory {
            match guard.get(&vm.id) {
                Some(existing) => {
                    if vm.task.is_none() {
                        vm.task = existing.task.clone();
                    }
                    if existing.state != vm.state || existing.name != vm.name {
                        delta.changed.push(vm.clone());
                    }
                }
                None => delta.changed.push(vm.clone()),
            }
            guard.insert(vm.id.clone(), vm);
        }

        delta
    }
}
