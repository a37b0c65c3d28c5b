//! Labvisor Core
//!
//! VLAN allocation, the shared VM cache, the remote host client contract
//! and the task waiter shared by every host connection.

pub mod cache;
pub mod client;
pub mod error;
pub mod simulator;
pub mod task;
pub mod vlan;

pub use cache::{CacheDelta, VmCache};
pub use client::{
    DeviceChange, PortGroupRecord, TaskInfo, TaskRef, TaskState, VimClient, VmCreateSpec,
    VmRecord,
};
pub use error::HypervisorError;
pub use simulator::SimulatedHost;
pub use task::{wait_for_task, TaskWaitConfig};
pub use vlan::VlanManager;

/// Result type for hypervisor operations
pub type Result<T> = std::result::Result<T, HypervisorError>;
