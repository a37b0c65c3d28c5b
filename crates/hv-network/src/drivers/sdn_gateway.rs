//! Segments on an SDN gateway
//!
//! Networks are logical segments managed through the gateway's policy REST
//! API. Segments are created in a single hierarchical patch per batch; VM
//! NICs are still rewired through the host client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use labvisor_core::{HypervisorError, Result, TaskWaitConfig, VimClient};
use labvisor_shared_types::{
    NetworkBackendType, PortGroupAllocation, SdnConfiguration, Vlan, VmNet, VmNetwork,
};
use log::{debug, info};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{read_vm_networks, reconfigure_nic};
use crate::backend::{BackendContext, NetworkBackend};

const POLICY_ROOT: &str = "/policy/api/v1/infra";

/// Segment listing page
#[derive(Debug, Deserialize)]
struct SegmentList {
    #[serde(default)]
    results: Vec<Segment>,
    cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Segment {
    id: String,
    display_name: String,
    #[serde(default = "segment_resource_type")]
    resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transport_zone_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    vlan_ids: Vec<String>,
}

fn segment_resource_type() -> String {
    "Segment".to_string()
}

impl Segment {
    fn vlan_id(&self) -> u16 {
        self.vlan_ids
            .first()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
struct ChildSegment {
    resource_type: &'static str,
    #[serde(rename = "Segment")]
    segment: Segment,
}

/// Hierarchical policy patch body
#[derive(Debug, Serialize)]
struct InfraPatch {
    resource_type: &'static str,
    children: Vec<ChildSegment>,
}

#[derive(Debug, Clone)]
enum Credentials {
    Token(String),
    Basic { username: String, password: String },
}

/// Segment id for a network name. Ids may not carry the isolation delimiter.
pub fn segment_id(net: &str) -> String {
    net.chars()
        .map(|c| match c {
            '#' => '-',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect()
}

/// Policy path of a transport zone given either a bare id or a full path.
pub fn transport_zone_path(zone: &str) -> Option<String> {
    if zone.is_empty() {
        None
    } else if zone.starts_with('/') {
        Some(zone.to_string())
    } else {
        Some(format!(
            "/infra/sites/default/enforcement-points/default/transport-zones/{}",
            zone
        ))
    }
}

pub struct SdnGatewayBackend {
    client: Arc<dyn VimClient>,
    http: Client,
    base_url: String,
    credentials: Credentials,
    transport_zone: String,
    wait: TaskWaitConfig,
    cancel: CancellationToken,
}

impl SdnGatewayBackend {
    pub fn new(context: &BackendContext) -> Result<Self> {
        let sdn: &SdnConfiguration = &context.config.sdn;
        if sdn.api_url.is_empty() {
            return Err(HypervisorError::configuration(
                "SDN gateway backend requires sdn.api_url",
            ));
        }

        let credentials = if !sdn.token.is_empty() {
            Credentials::Token(sdn.token.clone())
        } else {
            Credentials::Basic {
                username: sdn.username.clone(),
                password: sdn.password.clone(),
            }
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(sdn.accept_invalid_certs)
            .build()
            .map_err(|e| HypervisorError::configuration(format!("SDN client: {}", e)))?;

        Ok(Self {
            client: context.client.clone(),
            http,
            base_url: sdn.api_url.trim_end_matches('/').to_string(),
            credentials,
            transport_zone: sdn.transport_zone.clone(),
            wait: context.wait.clone(),
            cancel: context.cancel.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .http
            .request(method, url)
            .header("Content-Type", "application/json");

        match &self.credentials {
            Credentials::Token(token) => request.bearer_auth(token),
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| HypervisorError::Remote(format!("SDN gateway unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(HypervisorError::Remote(format!(
                "SDN gateway request failed: {} - {}",
                status, text
            )));
        }

        Ok(response)
    }

    async fn list_segments(&self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let path = match &cursor {
                Some(c) => format!("{}/segments?cursor={}", POLICY_ROOT, urlencoding::encode(c)),
                None => format!("{}/segments", POLICY_ROOT),
            };
            let response = self.send(self.request(Method::GET, &path)).await?;
            let page: SegmentList = response
                .json()
                .await
                .map_err(|e| HypervisorError::Remote(format!("invalid segment list: {}", e)))?;

            segments.extend(page.results);
            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(segments)
    }

    fn build_patch(&self, vlans: &[Vlan]) -> InfraPatch {
        let zone = transport_zone_path(&self.transport_zone);
        InfraPatch {
            resource_type: "Infra",
            children: vlans
                .iter()
                .map(|vlan| ChildSegment {
                    resource_type: "ChildSegment",
                    segment: Segment {
                        id: segment_id(&vlan.name),
                        display_name: vlan.name.clone(),
                        resource_type: segment_resource_type(),
                        transport_zone_path: zone.clone(),
                        vlan_ids: if vlan.id > 0 {
                            vec![vlan.id.to_string()]
                        } else {
                            Vec::new()
                        },
                    },
                })
                .collect(),
        }
    }
}

#[async_trait]
impl NetworkBackend for SdnGatewayBackend {
    fn backend_type(&self) -> NetworkBackendType {
        NetworkBackendType::Sdn
    }

    fn uplink_switch(&self) -> String {
        self.transport_zone.clone()
    }

    fn uses_local_switches(&self) -> bool {
        false
    }

    async fn load_port_groups(&self) -> Result<Vec<PortGroupAllocation>> {
        let segments = self.list_segments().await?;
        Ok(segments
            .into_iter()
            .map(|s| {
                let vlan = s.vlan_id();
                PortGroupAllocation::new(s.display_name, s.id, vlan, &self.transport_zone)
            })
            .collect())
    }

    async fn add_port_groups(
        &self,
        switch: &str,
        vlans: &[Vlan],
    ) -> Result<Vec<PortGroupAllocation>> {
        let patch = self.build_patch(vlans);
        self.send(self.request(Method::PATCH, POLICY_ROOT).json(&patch))
            .await?;
        info!("Requested {} segments from SDN gateway", vlans.len());

        let existing = self.list_segments().await?;
        Ok(vlans
            .iter()
            .filter_map(|vlan| {
                existing
                    .iter()
                    .find(|s| s.display_name == vlan.name)
                    .map(|s| PortGroupAllocation::new(&vlan.name, &s.id, vlan.id, switch))
            })
            .collect())
    }

    async fn remove_port_group(&self, allocation: &PortGroupAllocation) -> Result<()> {
        let path = format!(
            "{}/segments/{}",
            POLICY_ROOT,
            urlencoding::encode(&allocation.key)
        );
        self.send(self.request(Method::DELETE, &path)).await?;
        debug!("Deleted segment {}", allocation.key);
        Ok(())
    }

    async fn add_switch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_switch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn get_vm_networks(&self, vm_reference: &str) -> Result<Vec<VmNetwork>> {
        read_vm_networks(self.client.as_ref(), vm_reference).await
    }

    async fn update_eth(&self, vm_reference: &str, eth: &VmNet) -> Result<()> {
        reconfigure_nic(self.client.as_ref(), &self.wait, &self.cancel, vm_reference, eth).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labvisor_core::SimulatedHost;
    use labvisor_shared_types::HypervisorServiceConfiguration;

    fn context(sdn: SdnConfiguration) -> BackendContext {
        let mut config = HypervisorServiceConfiguration::new("https://vcenter/sdk");
        config.network_backend = NetworkBackendType::Sdn;
        config.sdn = sdn;
        BackendContext {
            client: Arc::new(SimulatedHost::new("vcenter")),
            config,
            wait: TaskWaitConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_segment_id_strips_delimiter() {
        assert_eq!(segment_id("corp#abc123"), "corp-abc123");
        assert_eq!(segment_id("lab net#x"), "lab_net-x");
        assert_eq!(segment_id("shared"), "shared");
    }

    #[test]
    fn test_transport_zone_path() {
        assert_eq!(transport_zone_path(""), None);
        assert_eq!(
            transport_zone_path("tz-overlay").as_deref(),
            Some("/infra/sites/default/enforcement-points/default/transport-zones/tz-overlay")
        );
        assert_eq!(
            transport_zone_path("/infra/custom/tz").as_deref(),
            Some("/infra/custom/tz")
        );
    }

    #[test]
    fn test_requires_api_url() {
        let result = SdnGatewayBackend::new(&context(SdnConfiguration::default()));
        assert!(matches!(result, Err(HypervisorError::Configuration { .. })));
    }

    #[test]
    fn test_patch_body_batches_segments() {
        let backend = SdnGatewayBackend::new(&context(SdnConfiguration {
            api_url: "https://nsx.example.com/".to_string(),
            token: "secret".to_string(),
            transport_zone: "tz-overlay".to_string(),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(backend.base_url, "https://nsx.example.com");
        assert!(matches!(backend.credentials, Credentials::Token(_)));

        let patch = backend.build_patch(&[Vlan::new(0, "corp#abc", false), Vlan::new(12, "lan#abc", false)]);
        let body = serde_json::to_value(&patch).unwrap();

        assert_eq!(body["resource_type"], "Infra");
        let children = body["children"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0]["resource_type"], "ChildSegment");
        assert_eq!(children[0]["Segment"]["id"], "corp-abc");
        assert_eq!(children[0]["Segment"]["display_name"], "corp#abc");
        assert!(children[0]["Segment"].get("vlan_ids").is_none());
        assert_eq!(children[1]["Segment"]["vlan_ids"][0], "12");
    }

    #[test]
    fn test_segment_list_parsing() {
        let page: SegmentList = serde_json::from_str(
            r#"{"results":[{"id":"corp-abc","display_name":"corp#abc","vlan_ids":["7"]}],"result_count":1}"#,
        )
        .unwrap();
        assert!(page.cursor.is_none());
        assert_eq!(page.results[0].vlan_id(), 7);
        assert_eq!(page.results[0].resource_type, "Segment");
    }
}
