pub mod config;
pub mod error;
pub mod events;
pub mod names;
pub mod network;
pub mod template;
pub mod vm;

pub use config::{
    HypervisorServiceConfiguration, HypervisorType, SdnConfiguration, VlanConfiguration,
    VlanReservation,
};
pub use error::{SharedResult, SharedTypeError};
pub use events::{EventKind, HypervisorEvent};
pub use names::{IsolationName, TAG_DELIMITER};
pub use network::{NetworkBackendType, PortGroupAllocation, Vlan, VmNetwork};
pub use template::{VmDisk, VmNet, VmTemplate};
pub use vm::{
    DeploymentContext, Vm, VmAnswer, VmConsole, VmKeyValue, VmOperation, VmOperationType,
    VmQuestion, VmQuestionChoice, VmState, VmTask,
};
