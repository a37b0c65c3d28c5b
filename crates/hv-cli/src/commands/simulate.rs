//! Simulate command
//!
//! Runs a full deployment against in-memory hosts: useful to try a lab
//! definition and a pool configuration before pointing them at real hosts.

use std::fs;

use anyhow::{Context, Result};
use labvisor_event_bus::EventBus;
use labvisor_service::{ClientRegistry, HypervisorService, LabvisorConfig, NetworkBackendFactory};
use labvisor_shared_types::{
    DeploymentContext, HypervisorServiceConfiguration, HypervisorType, Vm, VmTemplate,
};
use log::info;

pub const DEFAULT_POOL_URL: &str = "https://esx[1-2].lab/sdk";

#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    pub config: Option<String>,
    /// JSON deployment context; a two VM sample lab when absent
    pub lab: Option<String>,
    pub tag: Option<String>,
    pub format: String,
    pub cleanup: bool,
}

pub struct SimulateCommand;

impl SimulateCommand {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(&self, options: &SimulateOptions) -> Result<()> {
        let config = self.pool_config(options.config.as_deref())?;
        let tag = options.tag.clone().unwrap_or_else(generate_tag);
        let mut context = match &options.lab {
            Some(path) => load_lab(path)?,
            None => sample_lab(),
        };
        context.id = tag.clone();

        let vms = self.run(config, context, options.cleanup).await?;
        print_vms(&vms, &options.format)
    }

    fn pool_config(&self, path: Option<&str>) -> Result<HypervisorServiceConfiguration> {
        let mut config = match path {
            Some(path) => {
                LabvisorConfig::load_from_file(path)
                    .with_context(|| format!("Failed to load {}", path))?
                    .hypervisor
            }
            None => HypervisorServiceConfiguration::new(DEFAULT_POOL_URL),
        };
        config.hypervisor_type = HypervisorType::Mock;
        Ok(config)
    }

    /// Start a simulated pool, deploy `context` and shut the pool down.
    pub async fn run(
        &self,
        config: HypervisorServiceConfiguration,
        context: DeploymentContext,
        cleanup: bool,
    ) -> Result<Vec<Vm>> {
        let registry = ClientRegistry::with_default_connectors()?;
        let backends = NetworkBackendFactory::with_default_backends()?;
        let service = HypervisorService::start(config, &registry, &backends, EventBus::new())
            .await
            .context("Failed to start simulated pool")?;

        let tag = context.id.clone();
        let deployed = service.deploy_batch(context, true).await;

        let result = match deployed {
            Ok(vms) if cleanup => {
                let removed = service.delete_all(&format!("#{}", tag)).await;
                removed.map(|gone| {
                    info!("Removed {} vms of {}", gone.len(), tag);
                    vms
                })
            }
            other => other,
        };

        service.shutdown().await;
        result.with_context(|| format!("Deployment of {} failed", tag))
    }
}

impl Default for SimulateCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Short random isolation tag.
pub fn generate_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn load_lab(path: &str) -> Result<DeploymentContext> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read lab file: {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid lab definition in {}", path))
}

pub fn sample_lab() -> DeploymentContext {
    let mut gateway = VmTemplate::new("gateway", "")
        .with_network("corp")
        .with_network("dmz");
    let mut workstation = VmTemplate::new("workstation", "").with_network("corp");

    for template in [&mut gateway, &mut workstation] {
        template.use_uplink_switch = true;
        template.auto_start = true;
    }
    DeploymentContext::new("", vec![gateway, workstation])
}

fn print_vms(vms: &[Vm], format: &str) -> Result<()> {
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(vms)?);
        }
        "text" => {
            println!("{:<28} {:<12} {:<10} {}", "Name", "Host", "State", "Id");
            println!("{}", "-".repeat(72));
            for vm in vms {
                println!(
                    "{:<28} {:<12} {:<10} {}",
                    vm.name,
                    vm.host,
                    vm.state.to_string(),
                    vm.id
                );
            }
        }
        other => anyhow::bail!("Unsupported output format: {}", other),
    }
    Ok(())
}
