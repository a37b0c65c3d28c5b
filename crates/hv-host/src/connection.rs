//! Connection to one virtualization host

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use labvisor_core::{
    wait_for_task, DeviceChange, HypervisorError, Result, TaskInfo, TaskRef, TaskWaitConfig,
    VimClient, VlanManager, VmCache, VmCreateSpec, VmRecord,
};
use labvisor_event_bus::EventBus;
use labvisor_network::{BackendContext, NetworkBackendFactory, NetworkManager};
use labvisor_shared_types::{
    HypervisorEvent, HypervisorServiceConfiguration, IsolationName, Vm, VmAnswer, VmConsole,
    VmDisk, VmNet, VmState, VmTask, VmTemplate,
};
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::reconfigure::{iso_path, VmChange};
use crate::session::Session;

/// Name of the baseline snapshot taken right after a VM is created.
pub const ROOT_SNAPSHOT: &str = "Root Snapshot";

/// Shared state handed to every host connection by the service.
#[derive(Clone)]
pub struct HostContext {
    pub config: HypervisorServiceConfiguration,
    pub vlans: Arc<VlanManager>,
    pub cache: VmCache,
    pub events: EventBus,
    pub cancel: CancellationToken,
}

/// A remote task the monitor keeps polling.
#[derive(Debug, Clone)]
pub(crate) struct TrackedTask {
    pub task: TaskRef,
    /// VM id or disk path the task works on
    pub owner: String,
    pub label: String,
    pub progress: i32,
}

pub struct HostConnection {
    name: String,
    config: HypervisorServiceConfiguration,
    client: Arc<dyn VimClient>,
    session: Session,
    network: NetworkManager,
    vlans: Arc<VlanManager>,
    cache: VmCache,
    events: EventBus,
    wait: TaskWaitConfig,
    cancel: CancellationToken,
    /// Pending VM tasks keyed by task id
    pub(crate) vm_tasks: Mutex<HashMap<String, TrackedTask>>,
    /// Pending disk clones/creations keyed by disk path
    pub(crate) disk_tasks: Mutex<HashMap<String, TrackedTask>>,
    /// VMs a foreground delete is tearing down
    deleting: Mutex<HashSet<String>>,
}

impl HostConnection {
    pub fn new(
        client: Arc<dyn VimClient>,
        backends: &NetworkBackendFactory,
        context: HostContext,
    ) -> Result<Self> {
        let config = context.config;
        let wait = TaskWaitConfig {
            poll_interval: Duration::from_secs(config.task_poll_secs),
            timeout: Some(Duration::from_secs(config.task_timeout_minutes * 60)),
        };

        let backend = backends.create(
            config.network_backend,
            &BackendContext {
                client: client.clone(),
                config: config.clone(),
                wait: wait.clone(),
                cancel: context.cancel.clone(),
            },
        )?;
        let network = NetworkManager::new(
            backend,
            context.vlans.clone(),
            context.cache.clone(),
            &config,
        )?;

        Ok(Self {
            name: config.host_name(),
            session: Session::new(
                client.clone(),
                Duration::from_secs(config.keep_alive_minutes * 60),
            ),
            config,
            client,
            network,
            vlans: context.vlans,
            cache: context.cache,
            events: context.events,
            wait,
            cancel: context.cancel,
            vm_tasks: Mutex::new(HashMap::new()),
            disk_tasks: Mutex::new(HashMap::new()),
            deleting: Mutex::new(HashSet::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HypervisorServiceConfiguration {
        &self.config
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn client(&self) -> &dyn VimClient {
        self.client.as_ref()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Open the session, load the inventory and the host's networks.
    pub async fn initialize(&self) -> Result<()> {
        self.session.ensure_connected().await?;
        self.reload().await?;
        self.network.initialize().await?;
        info!("Host {} ready", self.name);
        Ok(())
    }

    async fn await_task(&self, task: &TaskRef) -> Result<TaskInfo> {
        match wait_for_task(self.client.as_ref(), task, &self.wait, &self.cancel).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.session.fault(&e).await;
                Err(e)
            }
        }
    }

    /// Run a remote call that returns a task and wait for it.
    async fn run<F>(&self, start: F) -> Result<TaskInfo>
    where
        F: std::future::Future<Output = Result<TaskRef>>,
    {
        let task = match start.await {
            Ok(task) => task,
            Err(e) => {
                self.session.fault(&e).await;
                return Err(e);
            }
        };
        self.await_task(&task).await
    }

    fn to_vm(&self, record: VmRecord) -> Vm {
        Vm {
            id: record.id,
            name: record.name,
            host: self.name.clone(),
            path: record.path,
            disk_path: record.disk_path,
            reference: record.reference,
            state: record.state,
            task: None,
            question: record.question,
            networks: record.networks,
        }
    }

    fn belongs_here(&self, name: &str) -> bool {
        name.is_tagged()
            && (self.config.tenant.is_empty() || name.tag().starts_with(&self.config.tenant))
    }

    /// Re-read the host inventory into the shared cache and announce what
    /// changed. VMs gone from the host give up their network attachments.
    pub async fn reload(&self) -> Result<usize> {
        self.session.connect().await?;
        let records = match self.client.list_vms().await {
            Ok(records) => records,
            Err(e) => {
                self.session.fault(&e).await;
                return Err(e);
            }
        };

        let inventory: Vec<Vm> = records
            .into_iter()
            .filter(|r| self.belongs_here(&r.name))
            .map(|r| self.to_vm(r))
            .collect();
        let count = inventory.len();

        let delta = self.cache.reconcile(&self.name, inventory).await;
        for vm in delta.changed {
            self.publish_state(&vm).await;
        }
        for vm in delta.removed {
            if self.deleting.lock().await.contains(&vm.id) {
                continue;
            }
            debug!("{} disappeared from {}", vm.name, self.name);
            self.network.detach(&vm.networks).await;
            self.forget_vm_tasks(&vm.id).await;
            self.events
                .notify(HypervisorEvent::VmRemoved {
                    id: vm.id,
                    name: vm.name,
                })
                .await;
        }

        Ok(count)
    }

    async fn publish_state(&self, vm: &Vm) {
        self.events
            .notify(HypervisorEvent::VmStateChanged {
                id: vm.id.clone(),
                name: vm.name.clone(),
                host: vm.host.clone(),
                state: vm.state,
            })
            .await;
    }

    /// Cached VM on this host.
    pub async fn load(&self, id: &str) -> Result<Vm> {
        match self.cache.get(id).await {
            Some(vm) if vm.host == self.name => Ok(vm),
            _ => Err(HypervisorError::not_found(format!("vm {}", id))),
        }
    }

    async fn set_state(&self, vm: &Vm, state: VmState) -> Vm {
        let updated = self
            .cache
            .update(&vm.id, |cached| cached.state = state)
            .await
            .unwrap_or_else(|| Vm {
                state,
                ..vm.clone()
            });
        self.publish_state(&updated).await;
        updated
    }

    pub async fn start(&self, id: &str) -> Result<Vm> {
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;
        self.run(self.client.power_on(&vm.reference)).await?;
        info!("Started {}", vm.name);
        Ok(self.set_state(&vm, VmState::Running).await)
    }

    pub async fn stop(&self, id: &str) -> Result<Vm> {
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;
        self.run(self.client.power_off(&vm.reference)).await?;
        info!("Stopped {}", vm.name);
        Ok(self.set_state(&vm, VmState::Off).await)
    }

    /// Snapshot the current state, then drop the previous snapshots. The
    /// removal is left to the task monitor; its failure does not fail the
    /// save.
    pub async fn save(&self, id: &str) -> Result<Vm> {
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;

        let previous = self.client.list_snapshots(&vm.reference).await?;
        let name = format!("{} {}", ROOT_SNAPSHOT, Utc::now().format("%Y%m%d%H%M%S"));
        self.run(self.client.create_snapshot(&vm.reference, &name))
            .await?;

        for snapshot in previous {
            match self.client.remove_snapshot(&vm.reference, &snapshot).await {
                Ok(task) => self.track_vm_task(&vm, task, "saving").await,
                Err(e) => debug!("Failed to remove snapshot {} of {}: {}", snapshot, vm.name, e),
            }
        }

        info!("Saved {}", vm.name);
        self.load(id).await
    }

    /// Revert to the current snapshot. A VM that was running is started
    /// again afterwards.
    pub async fn revert(&self, id: &str) -> Result<Vm> {
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;

        self.run(self.client.revert_snapshot(&vm.reference)).await?;
        let mut reverted = self.set_state(&vm, VmState::Off).await;

        if vm.is_running() {
            self.run(self.client.power_on(&vm.reference)).await?;
            reverted = self.set_state(&vm, VmState::Running).await;
        }

        info!("Reverted {}", vm.name);
        Ok(reverted)
    }

    /// Stop, detach from networks, destroy and evict a VM, then sweep the
    /// networks of its isolation tag.
    pub async fn delete(&self, id: &str) -> Result<Vm> {
        let vm = self.load(id).await?;
        self.deleting.lock().await.insert(vm.id.clone());
        let result = self.teardown(vm).await;
        self.deleting.lock().await.remove(id);
        result
    }

    async fn teardown(&self, mut vm: Vm) -> Result<Vm> {
        self.session.ensure_connected().await?;

        if vm.is_running() {
            self.run(self.client.power_off(&vm.reference)).await?;
            vm.state = VmState::Off;
        }

        if let Err(e) = self.network.unprovision(&vm.reference).await {
            debug!("Failed to release networks of {}: {}", vm.name, e);
        }

        self.run(self.client.destroy_vm(&vm.reference)).await?;
        self.cache.remove(&vm.id).await;
        self.forget_vm_tasks(&vm.id).await;
        info!("Deleted {} from {}", vm.name, self.name);

        self.events
            .notify(HypervisorEvent::VmRemoved {
                id: vm.id.clone(),
                name: vm.name.clone(),
            })
            .await;

        if vm.name.is_tagged() {
            self.network.clean(Some(vm.tag())).await;
        }
        Ok(vm)
    }

    /// Create a VM from a normalized template: networks first, then the VM,
    /// its baseline snapshot and, if requested, power on.
    pub async fn deploy(&self, template: VmTemplate) -> Result<Vm> {
        let mut template = template;
        let name = template.name.with_tag(&template.isolation_tag);
        self.session.ensure_connected().await?;

        self.network.provision(&mut template).await?;

        let spec = VmCreateSpec {
            path: format!("{}{}/", self.config.vm_store, name),
            name: name.clone(),
            pool_path: self.config.pool_path.clone(),
            template,
        };

        let created = match self.run(self.client.create_vm(&spec)).await {
            Ok(info) => info,
            Err(e) => {
                self.network.release(&spec.template.eth).await;
                return Err(e);
            }
        };
        let reference = created.result.ok_or_else(|| {
            HypervisorError::remote_task("create_vm", "host did not return a vm reference")
        })?;

        self.run(self.client.create_snapshot(&reference, ROOT_SNAPSHOT))
            .await?;

        if spec.template.auto_start {
            self.run(self.client.power_on(&reference)).await?;
        }

        let vm = self.refresh_one(&reference).await?;
        info!("Deployed {} on {}", vm.name, self.name);
        Ok(vm)
    }

    /// Read one VM back from the host and cache it.
    async fn refresh_one(&self, reference: &str) -> Result<Vm> {
        let records = self.client.list_vms().await?;
        let record = records
            .into_iter()
            .find(|r| r.reference == reference)
            .ok_or_else(|| HypervisorError::not_found(format!("vm {}", reference)))?;

        let vm = self.to_vm(record);
        self.cache.insert(vm.clone()).await;
        self.publish_state(&vm).await;
        Ok(vm)
    }

    pub async fn change_configuration(&self, id: &str, feature: &str, value: &str) -> Result<Vm> {
        let change = VmChange::parse(feature, value)?;
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;

        match change {
            VmChange::Iso(path) => {
                let path = iso_path(&self.config.iso_store, &path);
                self.run(
                    self.client
                        .reconfigure_vm(&vm.reference, &DeviceChange::Iso { path }),
                )
                .await?;
            }
            VmChange::Net { index, net } => {
                let net = if self.vlans.contains(&net) {
                    net
                } else {
                    net.with_tag(vm.tag())
                };
                let use_uplink = self.vlans.find(&net).map_or(true, |v| v.on_uplink);

                let keys = self.client.vm_network_keys(&vm.reference).await?;
                let mut eth = VmNet::new(index, net);
                eth.key = keys.get(index as usize).cloned().unwrap_or_default();
                self.network
                    .update_eth(&vm.reference, &mut eth, use_uplink)
                    .await?;

                let slot = index as usize;
                self.cache
                    .update(&vm.id, |cached| {
                        if let Some(key) = cached.networks.get_mut(slot) {
                            *key = eth.key.clone();
                        }
                    })
                    .await;
            }
            VmChange::Boot(seconds) => {
                self.run(
                    self.client
                        .reconfigure_vm(&vm.reference, &DeviceChange::BootDelay { seconds }),
                )
                .await?;
            }
            VmChange::Guest { key, value } => {
                self.run(
                    self.client
                        .reconfigure_vm(&vm.reference, &DeviceChange::GuestInfo { key, value }),
                )
                .await?;
            }
        }

        info!("Reconfigured {} ({})", vm.name, feature);
        self.load(id).await
    }

    pub async fn answer(&self, id: &str, answer: &VmAnswer) -> Result<Vm> {
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;

        self.client
            .answer_question(&vm.reference, &answer.question_id, &answer.choice_key)
            .await?;

        let updated = self
            .cache
            .update(&vm.id, |cached| cached.question = None)
            .await;
        Ok(updated.unwrap_or(Vm {
            question: None,
            ..vm
        }))
    }

    pub async fn display(&self, id: &str) -> Result<VmConsole> {
        let vm = self.load(id).await?;
        self.session.ensure_connected().await?;

        let ticket = self.client.console_ticket(&vm.reference).await?;
        Ok(VmConsole {
            id: vm.id.clone(),
            name: vm.name.clone(),
            is_running: vm.is_running(),
            url: rewrite_console_url(&ticket, &self.config.console_host),
        })
    }

    /// Bind VMs together with a host affinity rule, optionally powering
    /// them on afterwards.
    pub async fn set_affinity(&self, tag: &str, ids: &[String], start: bool) -> Result<Vec<Vm>> {
        let mut vms = Vec::with_capacity(ids.len());
        for id in ids {
            vms.push(self.load(id).await?);
        }
        self.session.ensure_connected().await?;

        let references: Vec<String> = vms.iter().map(|vm| vm.reference.clone()).collect();
        let rule = "affinity".with_tag(tag);
        self.run(self.client.set_affinity(&rule, &references)).await?;
        info!("Applied affinity rule {} to {} vms", rule, vms.len());

        if !start {
            return Ok(vms);
        }

        let mut started = Vec::with_capacity(vms.len());
        for vm in vms {
            if vm.is_running() {
                started.push(vm);
            } else {
                started.push(self.start(&vm.id).await?);
            }
        }
        Ok(started)
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        self.session.ensure_connected().await?;
        self.client.file_exists(path).await
    }

    pub async fn list_files(&self, folder: &str) -> Result<Vec<String>> {
        self.session.ensure_connected().await?;
        self.client.list_files(folder).await
    }

    /// Progress of a template disk: `-1` missing, `0..99` being created,
    /// `100` present.
    pub async fn disk_progress(&self, path: &str) -> Result<i32> {
        if let Some(tracked) = self.disk_tasks.lock().await.get(path) {
            return Ok(tracked.progress.clamp(0, 99));
        }
        Ok(if self.file_exists(path).await? { 100 } else { -1 })
    }

    /// Start cloning (when the disk has a source) or creating a disk. The
    /// task is left to the monitor.
    pub async fn create_disk(&self, disk: &VmDisk) -> Result<()> {
        if self.disk_tasks.lock().await.contains_key(&disk.path) {
            return Ok(());
        }
        self.session.ensure_connected().await?;

        let task = if disk.source.is_empty() {
            self.client.create_disk(disk).await?
        } else {
            self.client.copy_disk(&disk.source, &disk.path).await?
        };
        info!("Creating disk {} on {}", disk.path, self.name);
        self.disk_tasks.lock().await.insert(
            disk.path.clone(),
            TrackedTask {
                task,
                owner: disk.path.clone(),
                label: "disk".to_string(),
                progress: 0,
            },
        );
        Ok(())
    }

    pub async fn delete_disk(&self, path: &str) -> Result<()> {
        self.session.ensure_connected().await?;
        self.run(self.client.delete_disk(path)).await?;
        info!("Deleted disk {} from {}", path, self.name);
        Ok(())
    }

    async fn track_vm_task(&self, vm: &Vm, task: TaskRef, label: &str) {
        let vm_task = VmTask::new(task.id.clone(), label);
        self.cache
            .update(&vm.id, |cached| cached.task = Some(vm_task))
            .await;
        self.vm_tasks.lock().await.insert(
            task.id.clone(),
            TrackedTask {
                task,
                owner: vm.id.clone(),
                label: label.to_string(),
                progress: 0,
            },
        );
    }

    async fn forget_vm_tasks(&self, vm_id: &str) {
        self.vm_tasks
            .lock()
            .await
            .retain(|_, tracked| tracked.owner != vm_id);
    }

    /// Number of tasks the monitor is still following.
    pub async fn pending_tasks(&self) -> usize {
        self.vm_tasks.lock().await.len() + self.disk_tasks.lock().await.len()
    }

    pub(crate) fn cache(&self) -> &VmCache {
        &self.cache
    }

    pub(crate) fn warn_failed_task(&self, subject: &str, info: &TaskInfo) {
        warn!(
            "Task {} for {} on {} failed: {}",
            info.id,
            subject,
            self.name,
            info.error.as_deref().unwrap_or("unknown error")
        );
    }
}

/// Point a console URL at a public console host, keeping scheme and path.
pub fn rewrite_console_url(url: &str, console_host: &str) -> String {
    if console_host.is_empty() {
        return url.to_string();
    }

    let (scheme, rest) = match url.find("://") {
        Some(idx) => (&url[..idx + 3], &url[idx + 3..]),
        None => ("", url),
    };
    let path = rest.find('/').map(|idx| &rest[idx..]).unwrap_or("");
    format!("{}{}{}", scheme, console_host, path)
}
