//! Error types for hypervisor operations

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The host reported that an asynchronous task ended in error.
    #[error("{operation} failed: {message}")]
    RemoteTask { operation: String, message: String },

    /// Networks could not be confirmed on the host after creation.
    #[error("Failed to provision networks: {}", .missing.join(", "))]
    Provisioning { missing: Vec<String> },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Unable to reserve a vlan for {network}")]
    VlanExhausted { network: String },

    #[error("Invalid change: {feature}")]
    InvalidChange { feature: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    /// Remote fault outside of a task (rejected call, transport error).
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HypervisorError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        HypervisorError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn remote_task(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HypervisorError::RemoteTask {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        HypervisorError::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        HypervisorError::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    /// True when the session should be re-established before retrying.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, HypervisorError::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_error_lists_missing_networks() {
        let err = HypervisorError::Provisioning {
            missing: vec!["corp#abc".to_string(), "lan#abc".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Failed to provision networks: corp#abc, lan#abc"
        );
    }

    #[test]
    fn test_remote_task_error_carries_message() {
        let err = HypervisorError::remote_task("power_on", "Insufficient memory");
        assert_eq!(err.to_string(), "power_on failed: Insufficient memory");
        assert!(!err.is_connection_fault());
        assert!(HypervisorError::connection("esx1", "refused").is_connection_fault());
    }
}
