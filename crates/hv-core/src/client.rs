//! Remote virtualization host contract
//!
//! Every call may suspend and may fail. Long-running operations return a
//! [`TaskRef`] that callers poll with [`VimClient::task_info`].

use async_trait::async_trait;
use labvisor_shared_types::{VmDisk, VmQuestion, VmState, VmTemplate};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Handle to an asynchronous task running on a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub operation: String,
}

impl TaskRef {
    pub fn new(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub state: TaskState,
    pub progress: i32,
    /// Localized message reported by the host when the task failed
    pub error: Option<String>,
    /// Reference produced by the task, e.g. a new VM handle
    pub result: Option<String>,
}

/// One VM as reported by a host inventory query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub reference: String,
    pub path: String,
    pub disk_path: String,
    pub state: VmState,
    pub question: Option<VmQuestion>,
    /// Network keys backing the VM's virtual NICs
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroupRecord {
    pub name: String,
    pub key: String,
    pub vlan: u16,
    pub switch: String,
}

/// Everything a host needs to create a VM from a normalized template.
#[derive(Debug, Clone, PartialEq)]
pub struct VmCreateSpec {
    pub name: String,
    pub path: String,
    pub pool_path: String,
    pub template: VmTemplate,
}

/// Low-level device reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    Iso { path: String },
    Network { index: u32, net_key: String },
    BootDelay { seconds: u32 },
    GuestInfo { key: String, value: String },
}

#[async_trait]
pub trait VimClient: Send + Sync {
    fn host(&self) -> &str;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_connected(&self) -> bool;

    async fn list_vms(&self) -> Result<Vec<VmRecord>>;
    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<TaskRef>;
    async fn power_on(&self, reference: &str) -> Result<TaskRef>;
    async fn power_off(&self, reference: &str) -> Result<TaskRef>;
    async fn destroy_vm(&self, reference: &str) -> Result<TaskRef>;

    async fn create_snapshot(&self, reference: &str, name: &str) -> Result<TaskRef>;
    /// Snapshot ids, oldest first.
    async fn list_snapshots(&self, reference: &str) -> Result<Vec<String>>;
    async fn remove_snapshot(&self, reference: &str, snapshot: &str) -> Result<TaskRef>;
    /// Revert to the current (most recent) snapshot.
    async fn revert_snapshot(&self, reference: &str) -> Result<TaskRef>;

    async fn reconfigure_vm(&self, reference: &str, change: &DeviceChange) -> Result<TaskRef>;
    async fn answer_question(&self, reference: &str, question_id: &str, choice: &str)
        -> Result<()>;
    async fn console_ticket(&self, reference: &str) -> Result<String>;
    async fn set_affinity(&self, rule: &str, references: &[String]) -> Result<TaskRef>;

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo>;

    async fn file_exists(&self, path: &str) -> Result<bool>;
    async fn list_files(&self, folder: &str) -> Result<Vec<String>>;
    async fn copy_disk(&self, source: &str, dest: &str) -> Result<TaskRef>;
    async fn create_disk(&self, disk: &VmDisk) -> Result<TaskRef>;
    async fn delete_disk(&self, path: &str) -> Result<TaskRef>;

    async fn list_port_groups(&self) -> Result<Vec<PortGroupRecord>>;
    /// Returns the key of the new host portgroup.
    async fn add_port_group(&self, switch: &str, name: &str, vlan: u16) -> Result<String>;
    async fn remove_port_group(&self, key: &str) -> Result<()>;
    async fn add_distributed_port_group(&self, switch: &str, name: &str, vlan: u16)
        -> Result<TaskRef>;
    async fn remove_distributed_port_group(&self, key: &str) -> Result<TaskRef>;
    async fn add_switch(&self, name: &str) -> Result<()>;
    async fn remove_switch(&self, name: &str) -> Result<()>;
    async fn vm_network_keys(&self, reference: &str) -> Result<Vec<String>>;
}
