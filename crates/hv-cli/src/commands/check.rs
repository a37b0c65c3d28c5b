//! Check command

use std::path::Path;

use anyhow::{Context, Result};
use labvisor_service::hosts::expand_hosts;
use labvisor_service::LabvisorConfig;
use labvisor_shared_types::HypervisorServiceConfiguration;

/// Load and validate a configuration file without contacting any host
pub struct CheckCommand;

impl CheckCommand {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, config_path: &str) -> Result<()> {
        println!("Checking configuration: {}", config_path);

        if !Path::new(config_path).exists() {
            anyhow::bail!("Configuration file not found: {}", config_path);
        }

        let config = LabvisorConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load {}", config_path))?;
        println!("✓ Syntax check passed");

        config.validate().context("Validation failed")?;
        println!("✓ Validation passed");

        for line in self.summarize(&config.hypervisor)? {
            println!("  {}", line);
        }
        Ok(())
    }

    /// Human readable summary of the pool a configuration describes.
    pub fn summarize(&self, config: &HypervisorServiceConfiguration) -> Result<Vec<String>> {
        let hosts: Vec<String> = expand_hosts(config)?
            .iter()
            .map(|host| host.host_name())
            .collect();

        let vlan_range = match config.vlan.parse_range()? {
            Some((start, end)) => format!("{}-{}", start, end),
            None => "all".to_string(),
        };

        let mut lines = vec![
            format!("type:     {}", config.hypervisor_type),
            format!("hosts:    {}", hosts.join(", ")),
            format!("backend:  {}", config.network_backend),
            format!("uplink:   {}", config.uplink),
            format!("vlans:    {} ({} reserved)", vlan_range, config.vlan.reservations.len()),
        ];
        if !config.tenant.is_empty() {
            lines.push(format!("tenant:   {}", config.tenant));
        }
        Ok(lines)
    }
}

impl Default for CheckCommand {
    fn default() -> Self {
        Self::new()
    }
}
