//! In-memory virtualization host
//!
//! Backs the `mock` hypervisor type and the test suites. Remote effects are
//! applied when a call is made; the returned task then reports `Running`
//! for a configurable number of polls before it turns terminal. Failures
//! can be injected per operation name.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use labvisor_shared_types::{VmDisk, VmQuestion, VmState};
use log::debug;

use crate::client::{
    DeviceChange, PortGroupRecord, TaskInfo, TaskRef, TaskState, VimClient, VmCreateSpec,
    VmRecord,
};
use crate::error::HypervisorError;
use crate::Result;

#[derive(Debug, Clone)]
struct SimVm {
    record: VmRecord,
    snapshots: Vec<String>,
    iso: String,
    boot_delay: u32,
    guest_info: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct SimTask {
    info: TaskInfo,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    next_id: u64,
    polls_to_complete: u32,
    vms: HashMap<String, SimVm>,
    tasks: HashMap<String, SimTask>,
    port_groups: HashMap<String, PortGroupRecord>,
    switches: BTreeSet<String>,
    files: BTreeSet<String>,
    affinity_rules: HashMap<String, Vec<String>>,
    failures: HashMap<String, String>,
    calls: HashMap<String, usize>,
}

impl SimState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn record_call(&mut self, op: &str) {
        *self.calls.entry(op.to_string()).or_insert(0) += 1;
    }

    fn task(&mut self, op: &str, result: Option<String>) -> TaskRef {
        let id = self.next("task");
        let failure = self.failures.get(op).cloned();
        let info = TaskInfo {
            id: id.clone(),
            state: TaskState::Running,
            progress: 0,
            error: failure,
            result,
        };
        let polls_left = self.polls_to_complete;
        self.tasks.insert(id.clone(), SimTask { info, polls_left });
        TaskRef::new(id, op)
    }

    fn failed_task(&mut self, op: &str, message: String) -> TaskRef {
        let task = self.task(op, None);
        if let Some(t) = self.tasks.get_mut(&task.id) {
            t.info.error = Some(message);
        }
        task
    }

    fn fails(&self, op: &str) -> bool {
        self.failures.contains_key(op)
    }

    fn vm_mut(&mut self, reference: &str) -> Result<&mut SimVm> {
        self.vms
            .get_mut(reference)
            .ok_or_else(|| HypervisorError::Remote(format!("managed object {} not found", reference)))
    }
}

pub struct SimulatedHost {
    host: String,
    state: Mutex<SimState>,
}

impl SimulatedHost {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(SimState {
                polls_to_complete: 1,
                ..Default::default()
            }),
        }
    }

    /// Number of `task_info` polls a task reports `Running` before finishing.
    pub fn with_polls_to_complete(self, polls: u32) -> Self {
        self.lock().polls_to_complete = polls;
        self
    }

    /// Pre-existing virtual switch, e.g. the pool's uplink.
    pub fn with_switch(self, name: &str) -> Self {
        self.lock().switches.insert(name.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks the session and records the call.
    fn begin(&self, op: &str) -> Result<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        state.record_call(op);
        if !state.connected {
            return Err(HypervisorError::connection(&self.host, "not logged in"));
        }
        Ok(state)
    }

    fn direct_failure(state: &SimState, op: &str) -> Result<()> {
        match state.failures.get(op) {
            Some(message) => Err(HypervisorError::Remote(message.clone())),
            None => Ok(()),
        }
    }

    pub fn inject_failure(&self, op: &str, message: &str) {
        self.lock().failures.insert(op.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, op: &str) {
        self.lock().failures.remove(op);
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Drop the session as if the host had expired it.
    pub fn expire_session(&self) {
        self.lock().connected = false;
    }

    /// Register a VM that exists on the host before the service starts.
    pub fn add_vm(&self, name: &str, state: VmState, networks: Vec<String>) -> VmRecord {
        let mut sim = self.lock();
        let reference = sim.next("vm");
        let record = VmRecord {
            id: format!("{}-{}", self.host, reference),
            name: name.to_string(),
            reference: reference.clone(),
            path: String::new(),
            disk_path: String::new(),
            state,
            question: None,
            networks,
        };
        sim.vms.insert(
            reference,
            SimVm {
                record: record.clone(),
                snapshots: Vec::new(),
                iso: String::new(),
                boot_delay: 0,
                guest_info: HashMap::new(),
            },
        );
        record
    }

    /// Remove a VM behind the service's back.
    pub fn remove_vm_externally(&self, reference: &str) {
        self.lock().vms.remove(reference);
    }

    pub fn set_question(&self, reference: &str, question: Option<VmQuestion>) {
        if let Some(vm) = self.lock().vms.get_mut(reference) {
            vm.record.question = question;
        }
    }

    pub fn add_port_group_record(&self, record: PortGroupRecord) {
        let mut sim = self.lock();
        sim.switches.insert(record.switch.clone());
        sim.port_groups.insert(record.key.clone(), record);
    }

    pub fn add_file(&self, path: &str) {
        self.lock().files.insert(path.to_string());
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains(path)
    }

    pub fn port_group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().port_groups.values().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }

    pub fn switch_names(&self) -> Vec<String> {
        self.lock().switches.iter().cloned().collect()
    }

    pub fn vm_count(&self) -> usize {
        self.lock().vms.len()
    }

    pub fn vm_state(&self, reference: &str) -> Option<VmState> {
        self.lock().vms.get(reference).map(|vm| vm.record.state)
    }

    pub fn snapshots(&self, reference: &str) -> Vec<String> {
        self.lock()
            .vms
            .get(reference)
            .map(|vm| vm.snapshots.clone())
            .unwrap_or_default()
    }

    pub fn vm_iso(&self, reference: &str) -> Option<String> {
        self.lock().vms.get(reference).map(|vm| vm.iso.clone())
    }

    pub fn vm_boot_delay(&self, reference: &str) -> Option<u32> {
        self.lock().vms.get(reference).map(|vm| vm.boot_delay)
    }

    pub fn vm_guest_info(&self, reference: &str, key: &str) -> Option<String> {
        self.lock()
            .vms
            .get(reference)
            .and_then(|vm| vm.guest_info.get(key).cloned())
    }

    pub fn affinity_rule(&self, rule: &str) -> Option<Vec<String>> {
        self.lock().affinity_rules.get(rule).cloned()
    }
}

#[async_trait]
impl VimClient for SimulatedHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.lock();
        state.record_call("connect");
        if let Some(message) = state.failures.get("connect") {
            return Err(HypervisorError::connection(&self.host, message.clone()));
        }
        state.connected = true;
        debug!("simulated session opened on {}", self.host);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        state.record_call("disconnect");
        state.connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        let state = self.begin("list_vms")?;
        Self::direct_failure(&state, "list_vms")?;
        Ok(state.vms.values().map(|vm| vm.record.clone()).collect())
    }

    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<TaskRef> {
        let mut state = self.begin("create_vm")?;
        if state.fails("create_vm") {
            return Ok(state.task("create_vm", None));
        }

        if state.vms.values().any(|vm| vm.record.name == spec.name) {
            let message = format!("The name '{}' already exists.", spec.name);
            return Ok(state.failed_task("create_vm", message));
        }

        let reference = state.next("vm");
        let record = VmRecord {
            id: format!("{}-{}", self.host, reference),
            name: spec.name.clone(),
            reference: reference.clone(),
            path: spec.path.clone(),
            disk_path: spec
                .template
                .disks
                .first()
                .map(|d| d.path.clone())
                .unwrap_or_default(),
            state: VmState::Off,
            question: None,
            networks: spec.template.eth.iter().map(|e| e.key.clone()).collect(),
        };
        let guest_info = spec
            .template
            .guest_settings
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect();
        state.vms.insert(
            reference.clone(),
            SimVm {
                record,
                snapshots: Vec::new(),
                iso: spec.template.iso.clone(),
                boot_delay: spec.template.delay,
                guest_info,
            },
        );
        Ok(state.task("create_vm", Some(reference)))
    }

    async fn power_on(&self, reference: &str) -> Result<TaskRef> {
        let mut state = self.begin("power_on")?;
        if !state.fails("power_on") {
            state.vm_mut(reference)?.record.state = VmState::Running;
        }
        Ok(state.task("power_on", None))
    }

    async fn power_off(&self, reference: &str) -> Result<TaskRef> {
        let mut state = self.begin("power_off")?;
        if !state.fails("power_off") {
            state.vm_mut(reference)?.record.state = VmState::Off;
        }
        Ok(state.task("power_off", None))
    }

    async fn destroy_vm(&self, reference: &str) -> Result<TaskRef> {
        let mut state = self.begin("destroy_vm")?;
        if !state.fails("destroy_vm") {
            if state.vm_mut(reference)?.record.state == VmState::Running {
                return Ok(state.failed_task(
                    "destroy_vm",
                    "The attempted operation cannot be performed in the current state (Powered on).".to_string(),
                ));
            }
            state.vms.remove(reference);
        }
        Ok(state.task("destroy_vm", None))
    }

    async fn create_snapshot(&self, reference: &str, name: &str) -> Result<TaskRef> {
        let mut state = self.begin("create_snapshot")?;
        if !state.fails("create_snapshot") {
            let id = state.next("snapshot");
            debug!("snapshot {} ({}) on {}", id, name, reference);
            state.vm_mut(reference)?.snapshots.push(id);
        }
        Ok(state.task("create_snapshot", None))
    }

    async fn list_snapshots(&self, reference: &str) -> Result<Vec<String>> {
        let mut state = self.begin("list_snapshots")?;
        Ok(state.vm_mut(reference)?.snapshots.clone())
    }

    async fn remove_snapshot(&self, reference: &str, snapshot: &str) -> Result<TaskRef> {
        let mut state = self.begin("remove_snapshot")?;
        if !state.fails("remove_snapshot") {
            state.vm_mut(reference)?.snapshots.retain(|s| s != snapshot);
        }
        Ok(state.task("remove_snapshot", None))
    }

    async fn revert_snapshot(&self, reference: &str) -> Result<TaskRef> {
        let mut state = self.begin("revert_snapshot")?;
        if state.vm_mut(reference)?.snapshots.is_empty() {
            return Ok(state.failed_task("revert_snapshot", "No snapshot found".to_string()));
        }
        if !state.fails("revert_snapshot") {
            state.vm_mut(reference)?.record.state = VmState::Off;
        }
        Ok(state.task("revert_snapshot", None))
    }

    async fn reconfigure_vm(&self, reference: &str, change: &DeviceChange) -> Result<TaskRef> {
        let mut state = self.begin("reconfigure_vm")?;
        if !state.fails("reconfigure_vm") {
            let vm = state.vm_mut(reference)?;
            match change {
                DeviceChange::Iso { path } => vm.iso = path.clone(),
                DeviceChange::BootDelay { seconds } => vm.boot_delay = *seconds,
                DeviceChange::GuestInfo { key, value } => {
                    vm.guest_info.insert(key.clone(), value.clone());
                }
                DeviceChange::Network { index, net_key } => {
                    match vm.record.networks.get_mut(*index as usize) {
                        Some(slot) => *slot = net_key.clone(),
                        None => {
                            return Ok(state.failed_task(
                                "reconfigure_vm",
                                format!("Network adapter {} not found", index),
                            ))
                        }
                    }
                }
            }
        }
        Ok(state.task("reconfigure_vm", None))
    }

    async fn answer_question(
        &self,
        reference: &str,
        question_id: &str,
        choice: &str,
    ) -> Result<()> {
        let mut state = self.begin("answer_question")?;
        Self::direct_failure(&state, "answer_question")?;
        let vm = state.vm_mut(reference)?;
        let pending = matches!(&vm.record.question, Some(q) if q.id == question_id);
        if !pending {
            return Err(HypervisorError::Remote(format!(
                "question {} is not pending",
                question_id
            )));
        }
        debug!("answered {} with {}", question_id, choice);
        vm.record.question = None;
        Ok(())
    }

    async fn console_ticket(&self, reference: &str) -> Result<String> {
        let mut state = self.begin("console_ticket")?;
        state.vm_mut(reference)?;
        Ok(format!("wss://{}/ticket/{}", self.host, reference))
    }

    async fn set_affinity(&self, rule: &str, references: &[String]) -> Result<TaskRef> {
        let mut state = self.begin("set_affinity")?;
        if !state.fails("set_affinity") {
            state
                .affinity_rules
                .insert(rule.to_string(), references.to_vec());
        }
        Ok(state.task("set_affinity", None))
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo> {
        let mut state = self.begin("task_info")?;
        let sim_task = state
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| HypervisorError::Remote(format!("task {} not found", task.id)))?;

        if sim_task.polls_left > 0 {
            sim_task.polls_left -= 1;
            sim_task.info.progress = sim_task.progress_estimate();
            return Ok(sim_task.info.clone());
        }

        sim_task.info.progress = 100;
        sim_task.info.state = if sim_task.info.error.is_some() {
            TaskState::Error
        } else {
            TaskState::Success
        };
        Ok(sim_task.info.clone())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let state = self.begin("file_exists")?;
        Ok(state.files.contains(path))
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<String>> {
        let state = self.begin("list_files")?;
        Ok(state
            .files
            .iter()
            .filter(|f| f.starts_with(folder))
            .cloned()
            .collect())
    }

    async fn copy_disk(&self, source: &str, dest: &str) -> Result<TaskRef> {
        let mut state = self.begin("copy_disk")?;
        if !state.files.contains(source) {
            return Ok(state.failed_task("copy_disk", format!("File {} was not found", source)));
        }
        if !state.fails("copy_disk") {
            state.files.insert(dest.to_string());
        }
        Ok(state.task("copy_disk", None))
    }

    async fn create_disk(&self, disk: &VmDisk) -> Result<TaskRef> {
        let mut state = self.begin("create_disk")?;
        if !state.fails("create_disk") {
            state.files.insert(disk.path.clone());
        }
        Ok(state.task("create_disk", None))
    }

    async fn delete_disk(&self, path: &str) -> Result<TaskRef> {
        let mut state = self.begin("delete_disk")?;
        if !state.fails("delete_disk") {
            state.files.remove(path);
        }
        Ok(state.task("delete_disk", None))
    }

    async fn list_port_groups(&self) -> Result<Vec<PortGroupRecord>> {
        let state = self.begin("list_port_groups")?;
        Self::direct_failure(&state, "list_port_groups")?;
        Ok(state.port_groups.values().cloned().collect())
    }

    async fn add_port_group(&self, switch: &str, name: &str, vlan: u16) -> Result<String> {
        let mut state = self.begin("add_port_group")?;
        Self::direct_failure(&state, "add_port_group")?;
        if !state.switches.contains(switch) {
            return Err(HypervisorError::Remote(format!("switch {} not found", switch)));
        }
        if let Some(existing) = state.port_groups.values().find(|p| p.name == name) {
            return Ok(existing.key.clone());
        }
        let key = format!("HostPortGroup-{}", name);
        state.port_groups.insert(
            key.clone(),
            PortGroupRecord {
                name: name.to_string(),
                key: key.clone(),
                vlan,
                switch: switch.to_string(),
            },
        );
        Ok(key)
    }

    async fn remove_port_group(&self, key: &str) -> Result<()> {
        let mut state = self.begin("remove_port_group")?;
        Self::direct_failure(&state, "remove_port_group")?;
        state.port_groups.remove(key);
        Ok(())
    }

    async fn add_distributed_port_group(
        &self,
        switch: &str,
        name: &str,
        vlan: u16,
    ) -> Result<TaskRef> {
        let mut state = self.begin("add_distributed_port_group")?;
        if !state.fails("add_distributed_port_group")
            && !state.port_groups.values().any(|p| p.name == name)
        {
            let key = state.next("dvportgroup");
            state.switches.insert(switch.to_string());
            state.port_groups.insert(
                key.clone(),
                PortGroupRecord {
                    name: name.to_string(),
                    key,
                    vlan,
                    switch: switch.to_string(),
                },
            );
        }
        Ok(state.task("add_distributed_port_group", None))
    }

    async fn remove_distributed_port_group(&self, key: &str) -> Result<TaskRef> {
        let mut state = self.begin("remove_distributed_port_group")?;
        if !state.fails("remove_distributed_port_group") {
            state.port_groups.remove(key);
        }
        Ok(state.task("remove_distributed_port_group", None))
    }

    async fn add_switch(&self, name: &str) -> Result<()> {
        let mut state = self.begin("add_switch")?;
        Self::direct_failure(&state, "add_switch")?;
        state.switches.insert(name.to_string());
        Ok(())
    }

    async fn remove_switch(&self, name: &str) -> Result<()> {
        let mut state = self.begin("remove_switch")?;
        Self::direct_failure(&state, "remove_switch")?;
        if state.port_groups.values().any(|p| p.switch == name) {
            return Err(HypervisorError::Remote(format!("switch {} is in use", name)));
        }
        state.switches.remove(name);
        Ok(())
    }

    async fn vm_network_keys(&self, reference: &str) -> Result<Vec<String>> {
        let mut state = self.begin("vm_network_keys")?;
        Ok(state.vm_mut(reference)?.record.networks.clone())
    }
}

impl SimTask {
    fn progress_estimate(&self) -> i32 {
        if self.polls_left == 0 {
            100
        } else {
            (100 / (self.polls_left as i32 + 1)).min(99)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_require_session() {
        let host = SimulatedHost::new("esx1");
        let err = host.list_vms().await.unwrap_err();
        assert!(err.is_connection_fault());

        host.connect().await.unwrap();
        assert!(host.list_vms().await.unwrap().is_empty());

        host.expire_session();
        assert!(!host.is_connected().await);
    }

    #[tokio::test]
    async fn test_port_groups_need_existing_switch() {
        let host = SimulatedHost::new("esx1");
        host.connect().await.unwrap();

        assert!(host.add_port_group("vSwitch9", "lan#a", 10).await.is_err());

        host.add_switch("vSwitch9").await.unwrap();
        let key = host.add_port_group("vSwitch9", "lan#a", 10).await.unwrap();
        assert_eq!(host.port_group_names(), vec!["lan#a"]);

        assert!(host.remove_switch("vSwitch9").await.is_err());
        host.remove_port_group(&key).await.unwrap();
        host.remove_switch("vSwitch9").await.unwrap();
        assert!(host.switch_names().is_empty());
    }

    #[tokio::test]
    async fn test_task_progresses_then_completes() {
        let host = SimulatedHost::new("esx1").with_polls_to_complete(2);
        host.connect().await.unwrap();
        let vm = host.add_vm("db#a", VmState::Off, vec![]);

        let task = host.power_on(&vm.reference).await.unwrap();
        assert_eq!(host.task_info(&task).await.unwrap().state, TaskState::Running);
        assert_eq!(host.task_info(&task).await.unwrap().state, TaskState::Running);
        let done = host.task_info(&task).await.unwrap();
        assert_eq!(done.state, TaskState::Success);
        assert_eq!(done.progress, 100);
        assert_eq!(host.vm_state(&vm.reference), Some(VmState::Running));
    }
}
