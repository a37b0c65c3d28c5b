use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::names::IsolationName;
use crate::template::VmTemplate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Off,
    Running,
    Suspended,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Off => write!(f, "off"),
            VmState::Running => write!(f, "running"),
            VmState::Suspended => write!(f, "suspended"),
            VmState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A VM as tracked in the shared cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub host: String,
    pub path: String,
    pub disk_path: String,
    /// Opaque host handle (managed object reference)
    pub reference: String,
    pub state: VmState,
    pub task: Option<VmTask>,
    pub question: Option<VmQuestion>,
    /// Host keys of the networks behind the VM's NICs
    #[serde(default)]
    pub networks: Vec<String>,
}

impl Vm {
    pub fn tag(&self) -> &str {
        self.name.tag()
    }

    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }
}

/// Long-running remote operation attached to a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmTask {
    pub id: String,
    pub name: String,
    pub progress: i32,
    pub when: DateTime<Utc>,
}

impl VmTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            progress: 0,
            when: Utc::now(),
        }
    }
}

/// Pending interactive prompt raised by the hypervisor for a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmQuestion {
    pub id: String,
    pub prompt: String,
    pub default_choice: String,
    pub choices: Vec<VmQuestionChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmQuestionChoice {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmAnswer {
    pub question_id: String,
    pub choice_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmConsole {
    pub id: String,
    pub name: String,
    pub is_running: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VmKeyValue {
    pub key: String,
    pub value: String,
}

impl VmKeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmOperationType {
    Start,
    Stop,
    Save,
    Revert,
    Delete,
    Reset,
}

impl std::fmt::Display for VmOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmOperationType::Start => write!(f, "start"),
            VmOperationType::Stop => write!(f, "stop"),
            VmOperationType::Save => write!(f, "save"),
            VmOperationType::Revert => write!(f, "revert"),
            VmOperationType::Delete => write!(f, "delete"),
            VmOperationType::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op: VmOperationType,
}

impl VmOperation {
    pub fn new(id: impl Into<String>, op: VmOperationType) -> Self {
        Self { id: id.into(), op }
    }
}

/// Batch of templates deployed together for one isolation tag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentContext {
    pub id: String,
    pub templates: Vec<VmTemplate>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub affinity: bool,
}

impl DeploymentContext {
    pub fn new(id: impl Into<String>, templates: Vec<VmTemplate>) -> Self {
        Self {
            id: id.into(),
            templates,
            privileged: false,
            affinity: false,
        }
    }
}
