//! Remote client registry
//!
//! Maps a [`HypervisorType`] to the function that opens a client for one
//! host. Only the in-memory simulator ships built in; real hypervisor
//! clients are registered by the embedding application.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use labvisor_core::{HypervisorError, Result, SimulatedHost, VimClient};
use labvisor_shared_types::{HypervisorServiceConfiguration, HypervisorType};
use log::debug;

pub type ClientConnector =
    Box<dyn Fn(&HypervisorServiceConfiguration) -> Result<Arc<dyn VimClient>> + Send + Sync>;

fn simulated_host(config: &HypervisorServiceConfiguration) -> Result<Arc<dyn VimClient>> {
    let host = SimulatedHost::new(config.host_name())
        .with_polls_to_complete(0)
        .with_switch(&config.uplink);
    Ok(Arc::new(host))
}

#[derive(Default)]
pub struct ClientRegistry {
    connectors: RwLock<HashMap<HypervisorType, ClientConnector>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `mock` type backed by [`SimulatedHost`]
    pub fn with_default_connectors() -> Result<Self> {
        let registry = Self::new();
        registry.register(HypervisorType::Mock, Box::new(simulated_host))?;
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<HypervisorType, ClientConnector>> {
        self.connectors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<HypervisorType, ClientConnector>> {
        self.connectors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, kind: HypervisorType, connector: ClientConnector) -> Result<()> {
        let mut connectors = self.write();
        if connectors.contains_key(&kind) {
            return Err(HypervisorError::configuration(format!(
                "hypervisor type '{}' is already registered",
                kind
            )));
        }
        connectors.insert(kind, connector);
        debug!("Registered hypervisor client: {}", kind);
        Ok(())
    }

    pub fn supports(&self, kind: HypervisorType) -> bool {
        self.read().contains_key(&kind)
    }

    pub fn connect(&self, config: &HypervisorServiceConfiguration) -> Result<Arc<dyn VimClient>> {
        match self.read().get(&config.hypervisor_type) {
            Some(connector) => connector(config),
            None => Err(HypervisorError::configuration(format!(
                "no hypervisor client registered for '{}'",
                config.hypervisor_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_is_built_in() {
        let registry = ClientRegistry::with_default_connectors().unwrap();
        assert!(registry.supports(HypervisorType::Mock));
        assert!(!registry.supports(HypervisorType::Vsphere));

        let mut config = HypervisorServiceConfiguration::new("https://esx1.lab/sdk");
        config.hypervisor_type = HypervisorType::Mock;
        let client = registry.connect(&config).unwrap();
        assert_eq!(client.host(), "esx1.lab");
    }

    #[test]
    fn test_unregistered_type_is_configuration_error() {
        let registry = ClientRegistry::with_default_connectors().unwrap();
        let config = HypervisorServiceConfiguration::new("https://vcenter/sdk");
        assert!(matches!(
            registry.connect(&config),
            Err(HypervisorError::Configuration { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ClientRegistry::with_default_connectors().unwrap();
        let again = registry.register(HypervisorType::Mock, Box::new(simulated_host));
        assert!(matches!(again, Err(HypervisorError::Configuration { .. })));
    }
}
