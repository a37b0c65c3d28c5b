use serde::{Deserialize, Serialize};

use crate::vm::VmState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HypervisorEvent {
    /// A cached VM changed power state or was first seen
    VmStateChanged {
        id: String,
        name: String,
        host: String,
        state: VmState,
    },
    /// A VM disappeared from its host or was deleted
    VmRemoved { id: String, name: String },
    /// Batch deployment for an isolation tag finished
    DeploymentCompleted {
        isolation_tag: String,
        vms: Vec<String>,
    },
    /// Batch deployment for an isolation tag failed
    DeploymentFailed {
        isolation_tag: String,
        message: String,
    },
}

/// Coarse event category listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VmState,
    VmRemoved,
    Deployment,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::VmState => write!(f, "vm_state"),
            EventKind::VmRemoved => write!(f, "vm_removed"),
            EventKind::Deployment => write!(f, "deployment"),
        }
    }
}

impl HypervisorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HypervisorEvent::VmStateChanged { .. } => EventKind::VmState,
            HypervisorEvent::VmRemoved { .. } => EventKind::VmRemoved,
            HypervisorEvent::DeploymentCompleted { .. } | HypervisorEvent::DeploymentFailed { .. } => {
                EventKind::Deployment
            }
        }
    }
}
