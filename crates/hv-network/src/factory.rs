//! Network backend factory
//!
//! Backends are registered per [`NetworkBackendType`] and built on demand
//! for each host connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use labvisor_core::{HypervisorError, Result};
use labvisor_shared_types::NetworkBackendType;
use log::{debug, info};

use crate::backend::{BackendContext, NetworkBackend};
use crate::drivers::{DistributedSwitchBackend, HostSwitchBackend, SdnGatewayBackend};

/// Backend constructor function type
pub type BackendConstructor =
    Box<dyn Fn(&BackendContext) -> Result<Arc<dyn NetworkBackend>> + Send + Sync>;

fn host_switch(context: &BackendContext) -> Result<Arc<dyn NetworkBackend>> {
    Ok(Arc::new(HostSwitchBackend::new(context)))
}

fn distributed_switch(context: &BackendContext) -> Result<Arc<dyn NetworkBackend>> {
    Ok(Arc::new(DistributedSwitchBackend::new(context)))
}

fn sdn_gateway(context: &BackendContext) -> Result<Arc<dyn NetworkBackend>> {
    Ok(Arc::new(SdnGatewayBackend::new(context)?))
}

#[derive(Default)]
pub struct NetworkBackendFactory {
    constructors: RwLock<HashMap<NetworkBackendType, BackendConstructor>>,
}

impl NetworkBackendFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the host, distributed and SDN backends registered
    pub fn with_default_backends() -> Result<Self> {
        let factory = Self::new();

        factory.register(
            NetworkBackendType::Host,
            Box::new(host_switch),
        )?;
        factory.register(
            NetworkBackendType::Distributed,
            Box::new(distributed_switch),
        )?;
        factory.register(
            NetworkBackendType::Sdn,
            Box::new(sdn_gateway),
        )?;

        info!("Registered default network backends");
        Ok(factory)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NetworkBackendType, BackendConstructor>> {
        self.constructors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NetworkBackendType, BackendConstructor>> {
        self.constructors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a backend. A type can only be registered once.
    pub fn register(
        &self,
        backend_type: NetworkBackendType,
        constructor: BackendConstructor,
    ) -> Result<()> {
        let mut constructors = self.write();
        if constructors.contains_key(&backend_type) {
            return Err(HypervisorError::configuration(format!(
                "network backend '{}' is already registered",
                backend_type
            )));
        }
        constructors.insert(backend_type, constructor);
        debug!("Registered network backend: {}", backend_type);
        Ok(())
    }

    pub fn create(
        &self,
        backend_type: NetworkBackendType,
        context: &BackendContext,
    ) -> Result<Arc<dyn NetworkBackend>> {
        let constructors = self.read();
        match constructors.get(&backend_type) {
            Some(constructor) => {
                let backend = constructor(context)?;
                debug!("Created {} network backend for {}", backend_type, context.client.host());
                Ok(backend)
            }
            None => Err(HypervisorError::configuration(format!(
                "no network backend registered for '{}'",
                backend_type
            ))),
        }
    }

    pub fn supports(&self, backend_type: NetworkBackendType) -> bool {
        self.read().contains_key(&backend_type)
    }

    pub fn available_types(&self) -> Vec<NetworkBackendType> {
        let mut types: Vec<NetworkBackendType> = self.read().keys().copied().collect();
        types.sort_by_key(|t| t.to_string());
        types
    }
}
