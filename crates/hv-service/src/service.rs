//! Orchestration service
//!
//! Owns the host pool, the shared VM cache and the VLAN allocator, and
//! routes every VM operation to the host the VM lives on.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use labvisor_core::{HypervisorError, Result, VlanManager, VmCache};
use labvisor_event_bus::{EventBus, EventListener};
use labvisor_host::{HostConnection, HostContext};
use labvisor_network::NetworkBackendFactory;
use labvisor_shared_types::{
    DeploymentContext, EventKind, HypervisorEvent, HypervisorServiceConfiguration,
    IsolationName, Vm, VmAnswer, VmConsole, VmOperation, VmOperationType, VmTemplate,
};
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::affinity::{
    find_host_by_affinity, find_host_by_fewest_vms, find_host_by_random, HostAffinity,
};
use crate::connector::ClientRegistry;
use crate::hosts::expand_hosts;
use crate::normalize::{apply_tenant, normalize, rewrite_store};
use crate::queue::run_deploy_queue;

/// Subscription that forgets placements of tags whose VMs are gone.
const PLACEMENT_LISTENER: &str = "labvisor.placement";

struct PlacementPruner {
    service: Weak<HypervisorService>,
}

#[async_trait]
impl EventListener for PlacementPruner {
    async fn on_event(&self, _event: &HypervisorEvent) -> anyhow::Result<()> {
        if let Some(service) = self.service.upgrade() {
            service.forget_stale_tags().await;
        }
        Ok(())
    }
}

pub struct HypervisorService {
    pub(crate) config: HypervisorServiceConfiguration,
    pub(crate) hosts: Vec<Arc<HostConnection>>,
    pub(crate) vlans: Arc<VlanManager>,
    pub(crate) cache: VmCache,
    pub(crate) events: EventBus,
    affinity: HostAffinity,
    exclude: Option<Regex>,
    /// Serializes deployments per isolation tag
    tag_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(crate) queue: mpsc::UnboundedSender<DeploymentContext>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl HypervisorService {
    /// Validate the configuration, connect every host of the pool and
    /// start the background loops. A host that cannot be connected is
    /// logged and left out.
    pub async fn start(
        config: HypervisorServiceConfiguration,
        clients: &ClientRegistry,
        backends: &NetworkBackendFactory,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| HypervisorError::configuration(e.to_string()))?;
        if !clients.supports(config.hypervisor_type) {
            return Err(HypervisorError::configuration(format!(
                "no hypervisor client registered for '{}'",
                config.hypervisor_type
            )));
        }
        if !backends.supports(config.network_backend) {
            return Err(HypervisorError::configuration(format!(
                "no network backend registered for '{}'",
                config.network_backend
            )));
        }

        let exclude = match config.exclude_network_mask.as_str() {
            "" => None,
            mask => Some(Regex::new(mask).map_err(|e| {
                HypervisorError::configuration(format!("exclude_network_mask: {}", e))
            })?),
        };

        let vlans = Arc::new(VlanManager::new(&config.vlan)?);
        let cache = VmCache::new();
        let cancel = CancellationToken::new();

        let context = HostContext {
            config: config.clone(),
            vlans: vlans.clone(),
            cache: cache.clone(),
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let hosts = connect_hosts(clients, backends, context).await?;

        let (queue, receiver) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            config,
            hosts,
            vlans,
            cache,
            events,
            affinity: HostAffinity::new(),
            exclude,
            tag_locks: StdMutex::new(HashMap::new()),
            queue,
            cancel: cancel.clone(),
            background: Mutex::new(Vec::new()),
        });

        service
            .events
            .subscribe(
                PLACEMENT_LISTENER,
                &[EventKind::VmRemoved],
                PlacementPruner {
                    service: Arc::downgrade(&service),
                },
            )
            .await
            .map_err(|e| HypervisorError::configuration(e.to_string()))?;

        let mut handles = Vec::new();
        for host in &service.hosts {
            handles.extend(host.spawn_background());
        }
        handles.push(tokio::spawn(run_deploy_queue(
            Arc::downgrade(&service),
            receiver,
            cancel,
        )));
        *service.background.lock().await = handles;

        info!(
            "Hypervisor service ready with {} hosts: {}",
            service.hosts.len(),
            service.host_names().join(", ")
        );
        Ok(service)
    }

    /// Stop the background loops and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(e) = self.events.unsubscribe(PLACEMENT_LISTENER).await {
            debug!("{}", e);
        }
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }
        info!("Hypervisor service stopped");
    }

    pub fn config(&self) -> &HypervisorServiceConfiguration {
        &self.config
    }

    pub fn cache(&self) -> &VmCache {
        &self.cache
    }

    pub fn vlans(&self) -> &VlanManager {
        &self.vlans
    }

    pub fn hosts(&self) -> &[Arc<HostConnection>] {
        &self.hosts
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name().to_string()).collect()
    }

    /// Host an isolation tag is pinned to, if any.
    pub fn placement(&self, tag: &str) -> Option<String> {
        self.affinity.get(tag)
    }

    pub fn is_ready(&self) -> bool {
        !self.hosts.is_empty()
    }

    pub fn host(&self, name: &str) -> Result<&Arc<HostConnection>> {
        self.hosts
            .iter()
            .find(|h| h.name() == name)
            .ok_or_else(|| HypervisorError::not_found(format!("host {}", name)))
    }

    async fn host_for_vm(&self, id: &str) -> Result<&Arc<HostConnection>> {
        let vm = self.load(id).await?;
        self.host(&vm.host)
    }

    pub(crate) fn tag_lock(&self, tag: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .tag_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop affinity entries and idle deployment locks of tags without VMs.
    async fn forget_stale_tags(&self) {
        let live = self.cache.live_tags().await;
        self.affinity.prune(&live, &self.host_names());

        let mut locks = self
            .tag_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|tag, lock| live.contains(tag) || Arc::strong_count(lock) > 1);
    }

    /// Host for an isolation tag: the remembered one, then the host of an
    /// existing VM with the tag, then the least loaded host.
    pub(crate) async fn resolve_host(&self, tag: &str) -> Result<Arc<HostConnection>> {
        if let Some(name) = self.affinity.get(tag) {
            if let Ok(host) = self.host(&name) {
                return Ok(host.clone());
            }
        }

        let names = self.host_names();
        let vms = self.cache.values().await;
        let counts = self.cache.count_by_host().await;

        let chosen = find_host_by_affinity(tag, &vms)
            .filter(|h| names.contains(h))
            .or_else(|| find_host_by_fewest_vms(&names, &counts))
            .or_else(|| find_host_by_random(&names))
            .ok_or_else(|| HypervisorError::InvalidOperation("no hosts available".to_string()))?;

        if !tag.is_empty() {
            self.affinity.assign(tag, &chosen);
            debug!("Isolation tag {} placed on {}", tag, chosen);
        }
        self.host(&chosen).cloned()
    }

    /// Deploy one template. A VM that already exists for the template's
    /// name and tag is returned as is.
    pub async fn deploy(&self, template: VmTemplate, privileged: bool) -> Result<Vm> {
        let tag = apply_tenant(&template.isolation_tag, &self.config.tenant);
        if let Some(existing) = self.cache.find_by_name(&template.name.with_tag(&tag)).await {
            return Ok(existing);
        }

        let lock = self.tag_lock(&tag);
        let _guard = lock.lock().await;
        let host = self.resolve_host(&tag).await?;
        self.deploy_on(&host, template, privileged).await
    }

    pub(crate) async fn deploy_on(
        &self,
        host: &HostConnection,
        mut template: VmTemplate,
        privileged: bool,
    ) -> Result<Vm> {
        let tag = apply_tenant(&template.isolation_tag, &self.config.tenant);
        if let Some(existing) = self.cache.find_by_name(&template.name.with_tag(&tag)).await {
            return Ok(existing);
        }

        normalize(&mut template, privileged, &self.config, &self.vlans)?;
        let nets: Vec<String> = template.eth.iter().map(|eth| eth.net.clone()).collect();

        match host.deploy(template).await {
            Ok(vm) => Ok(vm),
            Err(e) => {
                self.release_unused_vlans(&nets).await;
                Err(e)
            }
        }
    }

    /// Give back the VLANs of tagged networks no host ended up carrying.
    async fn release_unused_vlans(&self, nets: &[String]) {
        for net in nets.iter().filter(|net| net.is_tagged()) {
            let mut held = false;
            for host in &self.hosts {
                if host.network().allocation(net).await.is_some() {
                    held = true;
                    break;
                }
            }
            if !held && self.vlans.contains(net) {
                debug!("Releasing vlan of {}", net);
                self.vlans.deactivate(net);
            }
        }
    }

    /// Deploy a batch for one isolation tag. Without `wait` the batch is
    /// queued and an empty list returned right away.
    pub async fn deploy_batch(&self, context: DeploymentContext, wait: bool) -> Result<Vec<Vm>> {
        if wait {
            return self.run_batch(context).await;
        }

        let tag = context.id.clone();
        self.queue
            .send(context)
            .map_err(|_| HypervisorError::Cancelled)?;
        debug!("Queued deployment of {}", tag);
        Ok(Vec::new())
    }

    /// Cached VM for a template, if deployed.
    pub async fn refresh(&self, template: &VmTemplate) -> Option<Vm> {
        let tag = apply_tenant(&template.isolation_tag, &self.config.tenant);
        self.cache.find_by_name(&template.name.with_tag(&tag)).await
    }

    pub async fn find(&self, term: &str) -> Vec<Vm> {
        self.cache.find(term).await
    }

    pub async fn load(&self, id: &str) -> Result<Vm> {
        self.cache
            .get(id)
            .await
            .ok_or_else(|| HypervisorError::not_found(format!("vm {}", id)))
    }

    pub async fn change_state(&self, operation: &VmOperation) -> Result<Vm> {
        let id = operation.id.as_str();
        let host = self.host_for_vm(id).await?;

        match operation.op {
            VmOperationType::Start => host.start(id).await,
            VmOperationType::Stop => host.stop(id).await,
            VmOperationType::Save => host.save(id).await,
            VmOperationType::Revert => host.revert(id).await,
            VmOperationType::Delete => self.delete(id).await,
            VmOperationType::Reset => {
                host.stop(id).await?;
                host.start(id).await
            }
        }
    }

    pub async fn change_configuration(&self, id: &str, feature: &str, value: &str) -> Result<Vm> {
        self.host_for_vm(id)
            .await?
            .change_configuration(id, feature, value)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<Vm> {
        self.host_for_vm(id).await?.delete(id).await
    }

    /// Delete every VM matching a tagged name fragment such as `#abc123`.
    pub async fn delete_all(&self, term: &str) -> Result<Vec<Vm>> {
        if !term.is_tagged() {
            return Err(HypervisorError::InvalidOperation(format!(
                "refusing to delete untagged vms matching '{}'",
                term
            )));
        }

        let targets = self.cache.find(term).await;
        let results = join_all(targets.iter().map(|vm| self.delete(&vm.id))).await;

        let mut deleted = Vec::new();
        for (vm, result) in targets.iter().zip(results) {
            match result {
                Ok(removed) => deleted.push(removed),
                Err(e) => warn!("Failed to delete {}: {}", vm.name, e),
            }
        }
        info!("Deleted {} of {} vms matching {}", deleted.len(), targets.len(), term);
        Ok(deleted)
    }

    pub async fn display(&self, id: &str) -> Result<VmConsole> {
        self.host_for_vm(id).await?.display(id).await
    }

    pub async fn answer(&self, id: &str, answer: &VmAnswer) -> Result<Vm> {
        self.host_for_vm(id).await?.answer(id, answer).await
    }

    /// Bind VMs of one host together and optionally power them on.
    pub async fn set_affinity(&self, tag: &str, ids: &[String], start: bool) -> Result<Vec<Vm>> {
        let first = ids.first().ok_or_else(|| {
            HypervisorError::InvalidOperation("affinity needs at least one vm".to_string())
        })?;
        let host = self.host_for_vm(first).await?;

        for id in ids {
            let vm = self.load(id).await?;
            if vm.host != host.name() {
                return Err(HypervisorError::InvalidOperation(format!(
                    "{} is on {}, not {}",
                    vm.name,
                    vm.host,
                    host.name()
                )));
            }
        }

        host.set_affinity(tag, ids, start).await
    }

    /// Force an inventory refresh on one host.
    pub async fn reload_host(&self, name: &str) -> Result<usize> {
        let count = self.host(name)?.reload().await?;
        self.forget_stale_tags().await;
        Ok(count)
    }

    /// ISO images in the public ISO folder and in the tag's own folder.
    pub async fn get_vm_iso_options(&self, tag: &str) -> Result<Vec<String>> {
        let host = self.first_host()?;
        let public = self.config.iso_store.clone();
        let private = format!("{}{}/", public, tag);

        let mut files = host.list_files(&public).await?;
        if !tag.is_empty() {
            files.extend(host.list_files(&private).await?);
        }

        let options: BTreeSet<String> = files
            .into_iter()
            .filter(|f| f.to_lowercase().ends_with(".iso"))
            .filter(|f| {
                let in_public = f
                    .strip_prefix(public.as_str())
                    .map_or(false, |name| !name.contains('/'));
                in_public || (!tag.is_empty() && f.starts_with(&private))
            })
            .collect();
        Ok(options.into_iter().collect())
    }

    /// Networks a VM of `tag` may be moved to.
    pub fn get_vm_net_options(&self, tag: &str) -> Vec<String> {
        let tag = apply_tenant(tag, &self.config.tenant);
        self.vlans
            .find_networks(&tag)
            .into_iter()
            .filter(|net| self.exclude.as_ref().map_or(true, |mask| !mask.is_match(net)))
            .collect()
    }

    fn first_host(&self) -> Result<&Arc<HostConnection>> {
        self.hosts
            .first()
            .ok_or_else(|| HypervisorError::InvalidOperation("no hosts available".to_string()))
    }

    async fn disk_progress(&self, path: &str) -> Result<i32> {
        let mut best = -1;
        for host in &self.hosts {
            best = best.max(host.disk_progress(path).await?);
            if best == 100 {
                break;
            }
        }
        Ok(best)
    }

    /// Least progress over the template's disks: `-1` missing, `0..99`
    /// being created, `100` present on some host.
    pub async fn verify_disks(&self, template: &VmTemplate) -> Result<i32> {
        let mut progress = 100;
        for disk in &template.disks {
            let path = rewrite_store(&disk.path, &self.config.disk_store);
            progress = progress.min(self.disk_progress(&path).await?);
        }
        Ok(progress)
    }

    /// Start creating the template's missing disks on the first host.
    pub async fn create_disks(&self, template: &VmTemplate) -> Result<i32> {
        let host = self.first_host()?;
        for disk in &template.disks {
            let mut disk = disk.clone();
            disk.path = rewrite_store(&disk.path, &self.config.disk_store);
            disk.source = rewrite_store(&disk.source, &self.config.disk_store);

            if self.disk_progress(&disk.path).await? < 0 {
                host.create_disk(&disk).await?;
            }
        }
        self.verify_disks(template).await
    }

    /// Delete the template's disks from every host holding them. Disks
    /// whose path lacks the isolation tag are stock disks and are kept.
    pub async fn delete_disks(&self, template: &VmTemplate) -> Result<()> {
        let tag = template.isolation_tag.as_str();
        for disk in &template.disks {
            let path = rewrite_store(&disk.path, &self.config.disk_store);
            if tag.is_empty() || !path.contains(tag) {
                warn!("Refusing to delete stock disk {}", path);
                continue;
            }

            for host in &self.hosts {
                if host.file_exists(&path).await? {
                    host.delete_disk(&path).await?;
                }
            }
        }
        Ok(())
    }
}

/// Build and initialize one connection per host of the pool, concurrently.
async fn connect_hosts(
    clients: &ClientRegistry,
    backends: &NetworkBackendFactory,
    context: HostContext,
) -> Result<Vec<Arc<HostConnection>>> {
    let configs = expand_hosts(&context.config)?;

    let attempts = configs.into_iter().map(|config| {
        let context = HostContext {
            config,
            ..context.clone()
        };
        async move {
            let name = context.config.host_name();
            (name, connect_host(clients, backends, context).await)
        }
    });

    let mut hosts = Vec::new();
    for (name, result) in join_all(attempts).await {
        match result {
            Ok(host) => hosts.push(Arc::new(host)),
            Err(e) => error!("Failed to connect host {}: {}", name, e),
        }
    }
    Ok(hosts)
}

async fn connect_host(
    clients: &ClientRegistry,
    backends: &NetworkBackendFactory,
    context: HostContext,
) -> Result<HostConnection> {
    let client = clients.connect(&context.config)?;
    let host = HostConnection::new(client, backends, context)?;
    host.initialize().await?;
    Ok(host)
}
