//! Network manager tests

use std::sync::Arc;
use std::time::Duration;

use labvisor_core::{
    HypervisorError, PortGroupRecord, SimulatedHost, TaskWaitConfig, VimClient, VlanManager,
    VmCache,
};
use labvisor_shared_types::{
    HypervisorServiceConfiguration, NetworkBackendType, PortGroupAllocation, Vlan,
    VlanConfiguration, Vm, VmState, VmTemplate,
};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendContext, MockNetworkBackend, NetworkBackend};
use crate::drivers::HostSwitchBackend;
use crate::factory::NetworkBackendFactory;
use crate::manager::NetworkManager;

fn config(grace_minutes: i64) -> HypervisorServiceConfiguration {
    let mut config = HypervisorServiceConfiguration::new("https://esx1/sdk");
    config.uplink = "vSwitch0".to_string();
    config.clean_grace_secs = grace_minutes * 60;
    config
}

fn context(host: Arc<SimulatedHost>, config: HypervisorServiceConfiguration) -> BackendContext {
    BackendContext {
        client: host,
        config,
        wait: TaskWaitConfig::default().with_poll_interval(Duration::from_millis(5)),
        cancel: CancellationToken::new(),
    }
}

struct Fixture {
    host: Arc<SimulatedHost>,
    cache: VmCache,
    vlans: Arc<VlanManager>,
    manager: NetworkManager,
}

async fn fixture_with(config: HypervisorServiceConfiguration, prepare: impl FnOnce(&SimulatedHost)) -> Fixture {
    let host = Arc::new(SimulatedHost::new("esx1"));
    host.connect().await.unwrap();
    host.add_switch("vSwitch0").await.unwrap();
    prepare(&host);

    let backend = Arc::new(HostSwitchBackend::new(&context(host.clone(), config.clone())));
    let vlans = Arc::new(VlanManager::new(&VlanConfiguration::default()).unwrap());
    let cache = VmCache::new();
    let manager = NetworkManager::new(backend, vlans.clone(), cache.clone(), &config).unwrap();

    Fixture {
        host,
        cache,
        vlans,
        manager,
    }
}

async fn fixture(grace_minutes: i64) -> Fixture {
    let fixture = fixture_with(config(grace_minutes), |_| {}).await;
    fixture.manager.initialize().await.unwrap();
    fixture
}

fn cached_vm(name: &str, reference: &str, state: VmState) -> Vm {
    Vm {
        id: format!("esx1-{}", reference),
        name: name.to_string(),
        host: "esx1".to_string(),
        reference: reference.to_string(),
        state,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_provision_on_uplink_records_key() {
    let f = fixture(2).await;
    let mut template = VmTemplate::new("db", "abc123").with_network("corp#abc123");
    template.use_uplink_switch = true;

    f.manager.provision(&mut template).await.unwrap();

    assert_eq!(template.eth[0].key, "HostPortGroup-corp#abc123");
    assert_eq!(template.eth[0].vlan, 1);
    let allocation = f.manager.allocation("corp#abc123").await.unwrap();
    assert_eq!(allocation.counter, 1);
    assert_eq!(allocation.switch, "vSwitch0");
    assert!(f.vlans.is_reserved(1));
    assert_eq!(f.host.port_group_names(), vec!["corp#abc123"]);
}

#[tokio::test]
async fn test_provision_skips_existing_networks() {
    let f = fixture(2).await;
    let mut first = VmTemplate::new("db", "abc").with_network("corp#abc");
    first.use_uplink_switch = true;
    let mut second = VmTemplate::new("web", "abc").with_network("corp#abc");
    second.use_uplink_switch = true;

    f.manager.provision(&mut first).await.unwrap();
    f.manager.provision(&mut second).await.unwrap();

    assert_eq!(f.host.call_count("add_port_group"), 1);
    assert_eq!(first.eth[0].key, second.eth[0].key);
    assert_eq!(f.manager.allocation("corp#abc").await.unwrap().counter, 2);
}

#[tokio::test]
async fn test_local_switch_is_reference_counted() {
    let f = fixture(-1).await;
    let mut template = VmTemplate::new("app", "lab1")
        .with_network("a#lab1")
        .with_network("b#lab1")
        .with_network("c#lab1");
    template.use_uplink_switch = false;

    f.manager.provision(&mut template).await.unwrap();
    assert_eq!(f.manager.switch_count("sw#lab1").await, Some(3));
    assert!(f.host.switch_names().contains(&"sw#lab1".to_string()));
    assert!(template.eth.iter().all(|eth| eth.vlan > 100));

    let keys = template.eth.iter().map(|eth| eth.key.clone()).collect();
    let vm = f.host.add_vm("app#lab1", VmState::Off, keys);
    f.manager.unprovision(&vm.reference).await.unwrap();

    let removed = f.manager.clean(Some("lab1")).await;
    assert_eq!(removed.len(), 3);
    assert_eq!(f.manager.switch_count("sw#lab1").await, None);
    assert_eq!(f.host.switch_names(), vec!["vSwitch0"]);
    assert!(f.host.port_group_names().is_empty());
    assert!(!f.vlans.contains("a#lab1"));
}

#[tokio::test]
async fn test_clean_keeps_networks_of_live_vms() {
    let f = fixture(-1).await;
    let mut template = VmTemplate::new("app", "abc123").with_network("corp#abc123");
    template.use_uplink_switch = true;
    f.manager.provision(&mut template).await.unwrap();

    let vm = f.host.add_vm("app#abc123", VmState::Running, vec![template.eth[0].key.clone()]);
    f.cache
        .insert(cached_vm("app#abc123", &vm.reference, VmState::Running))
        .await;

    // Counter drops to zero, but the VM is still around.
    f.manager.unprovision(&vm.reference).await.unwrap();
    assert_eq!(f.manager.allocation("corp#abc123").await.unwrap().counter, 0);

    assert!(f.manager.clean(Some("abc123")).await.is_empty());
    assert!(f.manager.clean(None).await.is_empty());
    assert!(f.manager.allocation("corp#abc123").await.is_some());

    f.cache.remove(&format!("esx1-{}", vm.reference)).await;
    assert_eq!(f.manager.clean(Some("abc123")).await, vec!["corp#abc123"]);
    assert!(f.manager.allocation("corp#abc123").await.is_none());
    assert!(!f.vlans.is_reserved(1));
}

#[tokio::test]
async fn test_clean_waits_for_grace_period() {
    let f = fixture(2).await;
    f.manager
        .provision_all(&[Vlan::new(9, "corp#abc", true)], true)
        .await
        .unwrap();

    assert!(f.manager.clean(None).await.is_empty());
    assert!(f.manager.allocation("corp#abc").await.is_some());
}

#[tokio::test]
async fn test_clean_only_touches_requested_tag() {
    let f = fixture(-1).await;
    f.manager
        .provision_all(
            &[Vlan::new(9, "corp#abc", true), Vlan::new(10, "corp#xyz", true)],
            true,
        )
        .await
        .unwrap();

    assert_eq!(f.manager.clean(Some("xyz")).await, vec!["corp#xyz"]);
    assert!(f.manager.allocation("corp#abc").await.is_some());
}

#[tokio::test]
async fn test_initialize_counts_attached_vms() {
    let f = fixture_with(config(2), |host| {
        host.add_port_group_record(PortGroupRecord {
            name: "corp#abc".to_string(),
            key: "HostPortGroup-corp#abc".to_string(),
            vlan: 7,
            switch: "vSwitch0".to_string(),
        });
        host.add_port_group_record(PortGroupRecord {
            name: "VM Network".to_string(),
            key: "HostPortGroup-VM Network".to_string(),
            vlan: 0,
            switch: "vSwitch0".to_string(),
        });
    })
    .await;

    let vm = f
        .host
        .add_vm("db#abc", VmState::Running, vec!["HostPortGroup-corp#abc".to_string()]);
    f.cache
        .insert(cached_vm("db#abc", &vm.reference, VmState::Running))
        .await;

    f.manager.initialize().await.unwrap();

    assert_eq!(f.manager.allocations().await.len(), 2);
    assert_eq!(f.manager.allocation("corp#abc").await.unwrap().counter, 1);
    assert_eq!(f.manager.allocation("VM Network").await.unwrap().counter, 0);
    assert_eq!(f.manager.switch_count("vSwitch0").await, Some(2));

    let vlan = f.vlans.find("corp#abc").unwrap();
    assert_eq!(vlan.id, 7);
    assert!(vlan.on_uplink);
    assert!(f.vlans.is_reserved(7));
}

#[tokio::test]
async fn test_initialize_skips_excluded_and_foreign_networks() {
    let mut config = config(2);
    config.exclude_network_mask = "^Management".to_string();
    config.tenant = "t1".to_string();

    let f = fixture_with(config, |host| {
        for (name, vlan) in [("Management Network", 0), ("corp#t1abc", 5), ("corp#t2abc", 6), ("VM Network", 0)] {
            host.add_port_group_record(PortGroupRecord {
                name: name.to_string(),
                key: format!("HostPortGroup-{}", name),
                vlan,
                switch: "vSwitch0".to_string(),
            });
        }
    })
    .await;
    f.manager.initialize().await.unwrap();

    let nets: Vec<String> = f
        .manager
        .allocations()
        .await
        .into_iter()
        .map(|pg| pg.net)
        .collect();
    assert_eq!(nets, vec!["VM Network", "corp#t1abc"]);
    assert!(!f.manager.is_managed("Management Network"));
    assert!(!f.vlans.contains("corp#t2abc"));
}

#[tokio::test]
async fn test_update_eth_moves_attachment() {
    let f = fixture(2).await;
    let mut template = VmTemplate::new("db", "abc").with_network("corp#abc");
    template.use_uplink_switch = true;
    f.manager.provision(&mut template).await.unwrap();
    let vm = f.host.add_vm("db#abc", VmState::Off, vec![template.eth[0].key.clone()]);

    let mut eth = template.eth[0].clone();
    eth.net = "lan#abc".to_string();
    f.manager.update_eth(&vm.reference, &mut eth, true).await.unwrap();

    assert_eq!(eth.key, "HostPortGroup-lan#abc");
    assert_eq!(f.manager.allocation("corp#abc").await.unwrap().counter, 0);
    assert_eq!(f.manager.allocation("lan#abc").await.unwrap().counter, 1);
    assert_eq!(
        f.host.vm_network_keys(&vm.reference).await.unwrap(),
        vec!["HostPortGroup-lan#abc"]
    );
}

#[tokio::test]
async fn test_failed_provision_returns_fresh_vlans() {
    let f = fixture(2).await;
    f.host.inject_failure("add_port_group", "portgroup quota reached");
    let mut template = VmTemplate::new("db", "abc").with_network("corp#abc");
    template.use_uplink_switch = true;

    assert!(matches!(
        f.manager.provision(&mut template).await,
        Err(HypervisorError::Provisioning { .. })
    ));
    assert!(!f.vlans.contains("corp#abc"));
    assert!(!f.vlans.is_reserved(1));
    assert!(f.manager.allocation("corp#abc").await.is_none());

    f.host.clear_failure("add_port_group");
    f.manager.provision(&mut template).await.unwrap();
    assert_eq!(template.eth[0].vlan, 1);
    assert_eq!(f.manager.allocation("corp#abc").await.unwrap().counter, 1);
}

#[tokio::test]
async fn test_failed_update_eth_returns_fresh_vlan() {
    let f = fixture(2).await;
    let mut template = VmTemplate::new("db", "abc").with_network("corp#abc");
    template.use_uplink_switch = true;
    f.manager.provision(&mut template).await.unwrap();
    let vm = f.host.add_vm("db#abc", VmState::Off, vec![template.eth[0].key.clone()]);

    f.host.inject_failure("add_port_group", "portgroup quota reached");
    let mut eth = template.eth[0].clone();
    eth.net = "lan#abc".to_string();
    assert!(f.manager.update_eth(&vm.reference, &mut eth, true).await.is_err());

    assert!(!f.vlans.contains("lan#abc"));
    assert!(!f.vlans.is_reserved(2));
    assert!(f.vlans.contains("corp#abc"));
    assert_eq!(eth.key, template.eth[0].key);
    assert_eq!(f.manager.allocation("corp#abc").await.unwrap().counter, 1);
}

fn mock_backend() -> MockNetworkBackend {
    let mut backend = MockNetworkBackend::new();
    backend
        .expect_backend_type()
        .return_const(NetworkBackendType::Host);
    backend
        .expect_uplink_switch()
        .return_const("vSwitch0".to_string());
    backend.expect_uses_local_switches().return_const(true);
    backend
}

fn mock_manager(backend: MockNetworkBackend, grace_minutes: i64) -> NetworkManager {
    let vlans = Arc::new(VlanManager::new(&VlanConfiguration::default()).unwrap());
    NetworkManager::new(Arc::new(backend), vlans, VmCache::new(), &config(grace_minutes)).unwrap()
}

#[tokio::test]
async fn test_unconfirmed_networks_fail_provisioning() {
    let mut backend = mock_backend();
    backend
        .expect_add_port_groups()
        .times(1)
        .returning(|switch, vlans| {
            Ok(vlans
                .iter()
                .filter(|v| v.name != "lan#abc")
                .map(|v| PortGroupAllocation::new(&v.name, format!("key-{}", v.name), v.id, switch))
                .collect())
        });
    let manager = mock_manager(backend, 2);

    let mut template = VmTemplate::new("db", "abc")
        .with_network("corp#abc")
        .with_network("lan#abc");
    template.use_uplink_switch = true;

    match manager.provision(&mut template).await {
        Err(HypervisorError::Provisioning { missing }) => assert_eq!(missing, vec!["lan#abc"]),
        other => panic!("expected provisioning error, got {:?}", other),
    }
    assert_eq!(manager.allocation("corp#abc").await.unwrap().counter, 0);
}

#[tokio::test]
async fn test_local_switch_dropped_when_nothing_confirmed() {
    let mut backend = mock_backend();
    backend
        .expect_add_switch()
        .times(1)
        .returning(|_| Ok(()));
    backend
        .expect_add_port_groups()
        .returning(|_, _| Ok(Vec::new()));
    backend
        .expect_remove_switch()
        .times(1)
        .returning(|_| Err(HypervisorError::Remote("switch busy".to_string())));
    let manager = mock_manager(backend, 2);

    let result = manager
        .provision_all(&[Vlan::new(101, "corp#abc", false)], false)
        .await;
    assert!(matches!(result, Err(HypervisorError::Provisioning { .. })));
    assert_eq!(manager.switch_count("sw#abc").await, None);
}

#[tokio::test]
async fn test_cleanup_failure_is_swallowed() {
    let mut backend = mock_backend();
    backend.expect_add_port_groups().returning(|switch, vlans| {
        Ok(vlans
            .iter()
            .map(|v| PortGroupAllocation::new(&v.name, "key-1", v.id, switch))
            .collect())
    });
    backend
        .expect_remove_port_group()
        .times(1)
        .returning(|_| Err(HypervisorError::Remote("resource in use".to_string())));
    let manager = mock_manager(backend, -1);

    manager
        .provision_all(&[Vlan::new(3, "corp#abc", true)], true)
        .await
        .unwrap();

    assert!(manager.clean(None).await.is_empty());
    assert!(manager.allocation("corp#abc").await.is_some());
}

#[test]
fn test_factory_rejects_duplicates_and_unknown_types() {
    let factory = NetworkBackendFactory::new();
    let host = Arc::new(SimulatedHost::new("esx1"));
    let context = context(host, config(2));

    let err = factory
        .create(NetworkBackendType::Host, &context)
        .err()
        .unwrap();
    assert!(matches!(err, HypervisorError::Configuration { .. }));

    let defaults = NetworkBackendFactory::with_default_backends().unwrap();
    assert_eq!(defaults.available_types().len(), 3);
    let backend = defaults.create(NetworkBackendType::Host, &context).unwrap();
    assert_eq!(backend.backend_type(), NetworkBackendType::Host);

    let duplicate = defaults.register(
        NetworkBackendType::Host,
        Box::new(|context: &BackendContext| -> labvisor_core::Result<Arc<dyn NetworkBackend>> {
            Ok(Arc::new(HostSwitchBackend::new(context)))
        }),
    );
    assert!(matches!(duplicate, Err(HypervisorError::Configuration { .. })));

    // SDN needs an api url.
    assert!(defaults.create(NetworkBackendType::Sdn, &context).is_err());
}
