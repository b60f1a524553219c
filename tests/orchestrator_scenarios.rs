/*!
 * End-to-end deploy and teardown scenarios against mock hosts and services
 *
 * Every host command and every collaborator call lands in one shared event
 * log, so ordering across components can be asserted:
 * - Workers never boot before the masters are known and installed
 * - Step selection gates whole phases
 * - Booted workers are renamed exactly once
 * - Backend node errors abort the deploy with the failing node names
 */

use cda::config::{ClusterConfig, ClusterKind, Phase, StepSet};
use cda::error::{CdaError, EXIT_REMOTE};
use cda::services::InventoryHost;
use cda::testing::{self, EventLog, MockHosts, MockServices};
use cda::{ExecutionResult, Orchestrator};
use std::net::Ipv4Addr;
use std::sync::Arc;

struct Scenario {
    events: EventLog,
    hosts: MockHosts,
    mocks: MockServices,
}

impl Scenario {
    fn new() -> Self {
        cda::logging::init_test_logging();
        let events = EventLog::new();
        let scenario = Self {
            hosts: MockHosts::with_events(events.clone()),
            mocks: MockServices::with_events(events.clone()),
            events,
        };
        scenario
            .hosts
            .local()
            .respond("nproc", ExecutionResult::new("32\n", "", 0));
        scenario
    }

    fn orchestrator(&self, config: ClusterConfig, steps: StepSet) -> Orchestrator {
        Orchestrator::new(
            config,
            steps,
            self.mocks.services(),
            Arc::clone(&self.hosts.registry),
        )
        .unwrap()
        .with_ssh_keys(Vec::new())
    }

    /// Booted workers as the backend inventory lists them before renaming
    fn discover_workers(&self, addresses: &[Ipv4Addr]) {
        let mut inventory: Vec<InventoryHost> = addresses
            .iter()
            .enumerate()
            .map(|(i, ip)| InventoryHost {
                id: format!("host-{}", i),
                name: "localhost".into(),
                infra_env_id: Some("id-c1-x86_64".into()),
                status: Some("known".into()),
                ipv4_addresses: vec![*ip],
                mac_addresses: Vec::new(),
            })
            .collect();
        // A host of an unrelated infra-env reporting a worker address
        inventory.push(InventoryHost {
            id: "stale".into(),
            name: "localhost".into(),
            infra_env_id: Some("id-other".into()),
            status: Some("known".into()),
            ipv4_addresses: addresses.to_vec(),
            mac_addresses: Vec::new(),
        });
        self.mocks.backend.set_inventory(inventory);
    }

    fn pos(&self, needle: &str) -> usize {
        self.events
            .position(needle)
            .unwrap_or_else(|| panic!("no event matching {:?} in {:#?}", needle, self.events.entries()))
    }
}

fn worker_ip(i: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 122, 50 + i)
}

#[test]
fn test_fresh_deploy_orders_phases() {
    let scenario = Scenario::new();
    scenario.discover_workers(&[worker_ip(1)]);
    let mut orch = scenario.orchestrator(testing::cluster_config("c1", 2, 1), StepSet::all());

    orch.deploy().unwrap();

    // Masters boot only after the bridge and reservations exist
    assert!(scenario.pos("bridge: configure localhost") < scenario.pos("virt-install"));
    assert!(scenario.pos("dhcp: c1-master-2") < scenario.pos("-n c1-master-1"));

    // No worker boots before the masters are known and the install finished
    let first_worker_boot = scenario.pos("-n c1-worker-1 ");
    assert!(scenario.pos("-n c1-master-1 ") < first_worker_boot);
    assert!(scenario.pos("-n c1-master-2 ") < first_worker_boot);
    assert!(scenario.pos("backend: start c1") < first_worker_boot);
    assert!(scenario.pos("backend: wait_cluster c1") < first_worker_boot);
    assert!(scenario.pos("backend: download_kubeadmin_password c1") < scenario.pos("backend: wait_cluster c1"));
    assert!(scenario.pos("bridge: dns c1 192.168.122.99") < first_worker_boot);

    // Workers are renamed before their infra-env is started
    assert!(scenario.pos("backend: rename host-0 c1-worker-1") < scenario.pos("backend: start_infraenv c1-x86_64"));
    assert_eq!(scenario.events.count("backend: rename"), 1);

    let hosts = scenario.hosts.local().written("/etc/hosts").unwrap();
    assert!(hosts.ends_with("192.168.122.99 api.c1.redhat.com\n"));
    assert_eq!(
        orch.masters()[0].observed_ip,
        Some(Ipv4Addr::new(192, 168, 122, 11))
    );
}

#[test]
fn test_worker_step_skips_master_creation() {
    let scenario = Scenario::new();
    scenario.discover_workers(&[worker_ip(1)]);
    let mut orch = scenario.orchestrator(
        testing::cluster_config("c1", 3, 1),
        StepSet::only(&[Phase::Workers]),
    );

    orch.deploy().unwrap();

    assert!(!scenario.events.contains("backend: create_cluster"));
    assert!(!scenario.events.contains("backend: delete_cluster"));
    assert!(!scenario.events.contains("-n c1-master-"));
    // Previous workers are removed from the running cluster first
    assert!(scenario.pos("cluster: delete_node c1-worker-1") < scenario.pos("-n c1-worker-1 "));
    assert!(scenario.events.contains("backend: create_infraenv c1-x86_64 x86_64"));
    assert!(scenario.events.contains("backend: start_infraenv c1-x86_64"));
}

#[test]
fn test_correlation_renames_each_worker_once() {
    let scenario = Scenario::new();
    scenario.discover_workers(&[worker_ip(2), worker_ip(1), worker_ip(3)]);
    let mut orch = scenario.orchestrator(
        testing::cluster_config("c1", 1, 3),
        StepSet::only(&[Phase::Workers]),
    );

    orch.deploy().unwrap();

    assert_eq!(scenario.events.count("backend: rename"), 3);
    assert!(scenario.events.contains("backend: rename host-0 c1-worker-2"));
    assert!(scenario.events.contains("backend: rename host-1 c1-worker-1"));
    assert!(scenario.events.contains("backend: rename host-2 c1-worker-3"));
    assert!(!scenario.events.contains("backend: rename stale"));
}

#[test]
fn test_worker_without_reserved_address_is_found_by_mac() {
    let scenario = Scenario::new();
    let mut config = testing::cluster_config("c1", 1, 1);
    config.workers[0].ip = None;
    let seen = Ipv4Addr::new(192, 168, 122, 77);
    scenario.mocks.backend.set_inventory(vec![InventoryHost {
        id: "host-0".into(),
        name: "localhost.localdomain".into(),
        infra_env_id: Some("id-c1-x86_64".into()),
        status: Some("known".into()),
        ipv4_addresses: vec![seen],
        mac_addresses: vec!["52:54:00:00:02:01".into()],
    }]);
    let mut orch = scenario.orchestrator(config, StepSet::only(&[Phase::Workers]));

    orch.deploy().unwrap();

    assert!(!scenario.events.contains("dhcp: c1-worker-1"));
    assert!(scenario.events.contains("backend: rename host-0 c1-worker-1"));
    assert_eq!(orch.workers()[0].observed_ip, Some(seen));
    assert!(scenario.hosts.remote("192.168.122.77").ran("sudo chpasswd"));
}

#[test]
fn test_worker_outside_reserved_range_fails_correlation() {
    let scenario = Scenario::new();
    let mut config = testing::cluster_config("c1", 1, 1);
    config.workers[0].ip = Some(Ipv4Addr::new(10, 0, 0, 7));
    let mut orch = scenario.orchestrator(config, StepSet::only(&[Phase::Workers]));

    let err = orch.deploy().unwrap_err();
    assert!(matches!(err, CdaError::Correlation(_)));
    assert_eq!(err.exit_code(), EXIT_REMOTE);
    assert!(!scenario.events.contains("backend: rename"));
}

#[test]
fn test_master_node_error_aborts_deploy() {
    let scenario = Scenario::new();
    scenario.mocks.backend.set_status("c1-master-2", "error");
    let mut orch = scenario.orchestrator(testing::cluster_config("c1", 3, 1), StepSet::all());

    match orch.deploy() {
        Err(CdaError::NodeError { nodes }) => assert_eq!(nodes, vec!["c1-master-2".to_string()]),
        other => panic!("expected a node error, got {:?}", other.err()),
    }
    assert!(!scenario.events.contains("backend: start c1"));
    assert!(!scenario.events.contains("-n c1-worker-1 "));
    // Boot logs are collected for the failed wait
    assert!(scenario.hosts.local().ran("/var/log/libvirt/qemu/c1-master-2.log"));
}

#[test]
fn test_preflight_stops_before_any_change() {
    let scenario = Scenario::new();
    scenario
        .hosts
        .local()
        .respond("nproc", ExecutionResult::new("8\n", "", 0));
    let mut orch = scenario.orchestrator(testing::cluster_config("c1", 1, 0), StepSet::all());

    assert!(matches!(orch.deploy(), Err(CdaError::Config(_))));
    assert_eq!(scenario.events.entries(), vec!["localhost: nproc".to_string()]);
}

fn iso_config() -> ClusterConfig {
    let mut config = testing::cluster_config("c1", 1, 0);
    config.kind = ClusterKind::Iso;
    config.install_iso = Some("/srv/rhel.iso".into());
    config
}

#[test]
fn test_iso_teardown_contacts_nothing() {
    let scenario = Scenario::new();
    let mut orch = scenario.orchestrator(iso_config(), StepSet::all());

    orch.teardown(false).unwrap();
    assert!(scenario.events.entries().is_empty());
    assert_eq!(scenario.hosts.command_count(), 0);
}

#[test]
fn test_iso_deploy_boots_single_master() {
    let scenario = Scenario::new();
    let mut orch = scenario.orchestrator(iso_config(), StepSet::all());

    orch.deploy().unwrap();

    let local = scenario.hosts.local();
    assert!(local.ran("-n c1-master-1 "));
    assert!(local.copies().iter().any(|(src, _)| src.ends_with("rhel.iso")));
    assert!(!scenario.events.contains("backend:"));
    assert!(!local.ran("nproc"));
}

#[test]
fn test_iso_deploy_needs_masters_step() {
    let scenario = Scenario::new();
    let mut orch = scenario.orchestrator(iso_config(), StepSet::only(&[Phase::Pre, Phase::Workers]));

    orch.deploy().unwrap();
    assert_eq!(scenario.hosts.command_count(), 0);
}
