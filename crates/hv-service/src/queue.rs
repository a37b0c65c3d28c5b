//! Batch deployment
//!
//! A batch deploys every missing template of one isolation tag onto the
//! tag's host. Batches submitted without waiting go through a queue that a
//! single background consumer drains in order.

use std::sync::Weak;

use futures::future::join_all;
use labvisor_core::{HypervisorError, Result};
use labvisor_shared_types::{
    DeploymentContext, HypervisorEvent, IsolationName, NetworkBackendType, Vlan, Vm, VmTemplate,
};
use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::normalize::{apply_tenant, normalize};
use crate::service::HypervisorService;

const PREFIX_LEN: usize = 5;

/// Short random prefix that keeps a redeployed tag's segments apart from
/// segments of a previous attempt still being torn down.
pub fn random_prefix() -> String {
    let prefix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PREFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}-", prefix.to_lowercase())
}

/// Prefix every isolated network of the templates.
pub fn disambiguate(templates: &mut [VmTemplate], prefix: &str) {
    for template in templates.iter_mut() {
        for eth in template.eth.iter_mut() {
            if eth.net.is_tagged() && !eth.net.starts_with(prefix) {
                eth.net = format!("{}{}", prefix, eth.net);
            }
        }
    }
}

/// Distinct isolated networks of the templates, in first-seen order.
pub fn batch_networks(templates: &[VmTemplate]) -> Vec<Vlan> {
    let mut vlans: Vec<Vlan> = Vec::new();
    for template in templates {
        for eth in &template.eth {
            if eth.net.is_tagged() && !vlans.iter().any(|v| v.name == eth.net) {
                vlans.push(Vlan::new(eth.vlan, eth.net.clone(), template.use_uplink_switch));
            }
        }
    }
    vlans
}

impl HypervisorService {
    /// Deploy a batch now and announce the outcome.
    pub(crate) async fn run_batch(&self, context: DeploymentContext) -> Result<Vec<Vm>> {
        let tag = apply_tenant(&context.id, &self.config.tenant);
        let lock = self.tag_lock(&tag);
        let _guard = lock.lock().await;

        match self.deploy_tag(&tag, context).await {
            Ok(vms) => {
                info!("Deployed {} vms for {}", vms.len(), tag);
                self.events
                    .notify(HypervisorEvent::DeploymentCompleted {
                        isolation_tag: tag,
                        vms: vms.iter().map(|vm| vm.name.clone()).collect(),
                    })
                    .await;
                Ok(vms)
            }
            Err(e) => {
                warn!("Deployment of {} failed: {}", tag, e);
                self.events
                    .notify(HypervisorEvent::DeploymentFailed {
                        isolation_tag: tag,
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn deploy_tag(&self, tag: &str, context: DeploymentContext) -> Result<Vec<Vm>> {
        let mut templates = context.templates;
        for template in templates.iter_mut() {
            template.isolation_tag = tag.to_string();
        }

        let mut missing = Vec::new();
        for template in &templates {
            if self.cache.find_by_name(&template.tagged_name()).await.is_none() {
                missing.push(template.clone());
            }
        }
        if missing.is_empty() {
            return Ok(self.tag_vms(tag).await);
        }

        let host = self.resolve_host(tag).await?;

        if self.config.network_backend == NetworkBackendType::Sdn && self.hosts.len() == 1 {
            let partial = self.cache.with_tag(tag).await;
            if !partial.is_empty() {
                info!("Removing partial deployment of {} ({} vms)", tag, partial.len());
                for vm in partial {
                    host.delete(&vm.id).await?;
                }
                missing = templates;
            }

            for template in missing.iter_mut() {
                normalize(template, context.privileged, &self.config, &self.vlans)?;
            }
            disambiguate(&mut missing, &random_prefix());

            let use_uplink = missing.iter().any(|t| t.use_uplink_switch);
            host.network()
                .provision_all(&batch_networks(&missing), use_uplink)
                .await?;
        }

        let results = join_all(
            missing
                .into_iter()
                .map(|template| self.deploy_on(&host, template, context.privileged)),
        )
        .await;

        let mut first_error: Option<HypervisorError> = None;
        for result in results {
            if let Err(e) = result {
                warn!("Deployment for {} failed: {}", tag, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let vms = self.tag_vms(tag).await;
        if context.affinity && self.config.host_affinity {
            let ids: Vec<String> = vms.iter().map(|vm| vm.id.clone()).collect();
            return host.set_affinity(tag, &ids, true).await;
        }
        Ok(vms)
    }

    async fn tag_vms(&self, tag: &str) -> Vec<Vm> {
        let mut vms = self.cache.with_tag(tag).await;
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        vms
    }
}

/// Drain queued batches until the service is dropped or cancelled.
pub(crate) async fn run_deploy_queue(
    service: Weak<HypervisorService>,
    mut receiver: UnboundedReceiver<DeploymentContext>,
    cancel: CancellationToken,
) {
    info!("Deployment queue started");
    loop {
        let context = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(context) => context,
                None => break,
            },
        };

        let service = match service.upgrade() {
            Some(service) => service,
            None => break,
        };
        let tag = context.id.clone();
        if let Err(e) = service.run_batch(context).await {
            warn!("Queued deployment of {} failed: {}", tag, e);
        }
    }
    info!("Deployment queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, nets: &[&str], uplink: bool) -> VmTemplate {
        let mut template = VmTemplate::new(name, "abc");
        for net in nets {
            template = template.with_network(*net);
        }
        template.use_uplink_switch = uplink;
        template
    }

    #[test]
    fn test_random_prefix_shape() {
        let prefix = random_prefix();
        assert_eq!(prefix.len(), PREFIX_LEN + 1);
        assert!(prefix.ends_with('-'));
        assert!(prefix[..PREFIX_LEN]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_disambiguate_only_touches_isolated_networks() {
        let mut templates = vec![template("db", &["corp#abc", "shared"], true)];
        disambiguate(&mut templates, "x1y2z-");
        disambiguate(&mut templates, "x1y2z-");

        assert_eq!(templates[0].eth[0].net, "x1y2z-corp#abc");
        assert_eq!(templates[0].eth[1].net, "shared");
    }

    #[test]
    fn test_batch_networks_are_distinct() {
        let templates = vec![
            template("db", &["corp#abc", "lan#abc"], true),
            template("web", &["corp#abc", "shared"], true),
        ];
        let names: Vec<String> = batch_networks(&templates)
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["corp#abc", "lan#abc"]);
    }
}
