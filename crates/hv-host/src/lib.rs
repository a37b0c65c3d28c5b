//! Labvisor Host
//!
//! One [`HostConnection`] per virtualization host: it owns the remote
//! session, the host's network manager, the VM lifecycle operations and
//! the background loops that keep the shared VM cache current.

pub mod connection;
pub mod monitor;
pub mod reconfigure;
pub mod session;


pub use connection::{HostConnection, HostContext};
pub use reconfigure::VmChange;
pub use session::Session;
