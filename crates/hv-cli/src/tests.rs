//! CLI command tests

use std::fs;

use labvisor_shared_types::{HypervisorServiceConfiguration, HypervisorType, VmState};
use tempfile::TempDir;

use crate::commands::simulate::{generate_tag, sample_lab};
use crate::commands::{CheckCommand, SimulateCommand, SimulateOptions};

const SAMPLE_CONFIG: &str = r#"
[hypervisor]
type = "vsphere"
url = "https://esx[01-03].lab/sdk"
uplink = "vSwitch1"
tenant = "t1"

[hypervisor.vlan]
range = "200-399"
reservations = [{ id = 200, name = "shared" }]
"#;

fn write_file(name: &str, content: &str) -> (TempDir, String) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join(name);
    fs::write(&path, content).expect("Failed to write test file");
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

#[tokio::test]
async fn test_check_valid_config() {
    let (_dir, path) = write_file("labvisor.toml", SAMPLE_CONFIG);
    CheckCommand::new().execute(&path).await.unwrap();
}

#[tokio::test]
async fn test_check_missing_file() {
    let result = CheckCommand::new().execute("/nonexistent/labvisor.toml").await;
    assert!(result.unwrap_err().to_string().contains("not found"));
}

#[tokio::test]
async fn test_check_rejects_reversed_vlan_range() {
    let (_dir, path) = write_file(
        "labvisor.toml",
        "[hypervisor]\nurl = \"https://esx1/sdk\"\nvlan = { range = \"400-200\" }\n",
    );
    let result = CheckCommand::new().execute(&path).await;
    assert!(result.unwrap_err().to_string().contains("Validation failed"));
}

#[test]
fn test_summary_expands_host_range() {
    let mut config = HypervisorServiceConfiguration::new("https://esx[01-03].lab/sdk");
    config.vlan.range = "200-399".to_string();
    config.tenant = "t1".to_string();

    let lines = CheckCommand::new().summarize(&config).unwrap();
    assert_eq!(lines[0], "type:     mock");
    assert_eq!(lines[1], "hosts:    esx01.lab, esx02.lab, esx03.lab");
    assert_eq!(lines[4], "vlans:    200-399 (0 reserved)");
    assert_eq!(lines[5], "tenant:   t1");
}

#[test]
fn test_generated_tag_is_short_and_untagged() {
    let tag = generate_tag();
    assert_eq!(tag.len(), 8);
    assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(tag, generate_tag());
}

#[tokio::test]
async fn test_simulate_deploys_sample_lab() {
    let mut config = HypervisorServiceConfiguration::new("https://esx[1-2].lab/sdk");
    config.hypervisor_type = HypervisorType::Mock;
    let mut lab = sample_lab();
    lab.id = "demo".to_string();

    let vms = SimulateCommand::new().run(config, lab, false).await.unwrap();

    let names: Vec<&str> = vms.iter().map(|vm| vm.name.as_str()).collect();
    assert_eq!(names, vec!["gateway#demo", "workstation#demo"]);
    assert_eq!(vms[0].host, vms[1].host);
    assert!(vms.iter().all(|vm| vm.state == VmState::Running));
}

#[tokio::test]
async fn test_simulate_with_lab_file_and_cleanup() {
    let (_dir, lab) = write_file(
        "lab.json",
        r#"{
  "id": "ignored",
  "templates": [
    { "name": "kali", "eth": [{ "id": 0, "net": "corp" }], "use_uplink_switch": true }
  ]
}"#,
    );
    let (_cfg_dir, config) = write_file(
        "labvisor.toml",
        "[hypervisor]\ntype = \"vsphere\"\nurl = \"https://esx1/sdk\"\n",
    );

    let options = SimulateOptions {
        config: Some(config),
        lab: Some(lab),
        tag: Some("t42".to_string()),
        format: "json".to_string(),
        cleanup: true,
    };
    SimulateCommand::new().execute(&options).await.unwrap();
}

#[tokio::test]
async fn test_simulate_rejects_unknown_format() {
    let options = SimulateOptions {
        tag: Some("fmt".to_string()),
        format: "yaml".to_string(),
        ..Default::default()
    };
    let result = SimulateCommand::new().execute(&options).await;
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Unsupported output format"));
}
