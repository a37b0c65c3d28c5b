//! Service configuration loading
//!
//! The configuration file is TOML with a `[hypervisor]` table. Any key can
//! be overridden from the environment with the `LABVISOR_` prefix and `__`
//! between nested keys, e.g. `LABVISOR_HYPERVISOR__PASSWORD`.

use std::path::Path;

use labvisor_shared_types::HypervisorServiceConfiguration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "LABVISOR";

pub const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/labvisor/labvisor.toml", "./labvisor.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabvisorConfig {
    pub hypervisor: HypervisorServiceConfiguration,
}

impl LabvisorConfig {
    /// Load a TOML file with environment overrides applied.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: LabvisorConfig = settings.try_deserialize()?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(loaded)
    }

    /// First readable file among [`DEFAULT_CONFIG_PATHS`], or defaults.
    pub fn load_with_defaults() -> Self {
        for path in DEFAULT_CONFIG_PATHS {
            if !Path::new(path).exists() {
                continue;
            }
            match Self::load_from_file(path) {
                Ok(loaded) => return loaded,
                Err(e) => warn!("Failed to load config from {}: {}", path, e),
            }
        }
        Self::default()
    }

    /// Parse TOML text without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hypervisor
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
