/*!
 * Test doubles for endpoints and collaborators
 *
 * [`MockEndpoint`] answers commands from a scripted table and records what it
 * was asked to do. [`MockHosts`] wires mock endpoints into a real
 * [`EndpointRegistry`]. [`MockServices`] bundles one mock per collaborator.
 * Everything can share one [`EventLog`] so tests can assert ordering across
 * hosts and collaborators.
 */

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{BmcConfig, ClusterConfig, ExtraConfigStep, NodeConfig, TimingConfig};
use crate::error::{CdaError, Result};
use crate::exec::{
    Endpoint, EndpointKind, EndpointRegistry, ExecutionResult, LoginSpec, RunOptions,
};
use crate::node::{Arch, Node, NodeKind};
use crate::services::{
    BootController, BridgeNetwork, ClusterApi, DhcpReservations, ExtraConfigRunner,
    InstallBackend, InventoryHost, Services,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of everything mocks were asked to do
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        lock(&self.0).push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first entry containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e.contains(needle))
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    pub fn count(&self, needle: &str) -> usize {
        lock(&self.0).iter().filter(|e| e.contains(needle)).count()
    }
}

#[derive(Default)]
struct MockState {
    responses: Vec<(String, ExecutionResult)>,
    commands: Vec<String>,
    copies: Vec<(PathBuf, String)>,
    written: BTreeMap<String, String>,
    connected_as: Option<String>,
}

/// Scripted endpoint
///
/// Commands are matched against registered substrings, the most recently
/// registered match wins, and anything unmatched succeeds with no output.
/// An endpoint named after an IPv4 address reports that address from
/// `ip -4 -o addr show`.
pub struct MockEndpoint {
    hostname: String,
    kind: EndpointKind,
    events: Option<EventLog>,
    state: Mutex<MockState>,
}

impl MockEndpoint {
    pub fn new(hostname: &str, kind: EndpointKind) -> Self {
        let endpoint = Self {
            hostname: hostname.to_string(),
            kind,
            events: None,
            state: Mutex::new(MockState::default()),
        };
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            endpoint.respond(
                "ip -4 -o addr show",
                ExecutionResult::new(
                    format!(
                        "1: lo    inet 127.0.0.1/8 scope host lo\n\
                         2: eth0    inet {}/24 brd 0.0.0.0 scope global dynamic eth0\n",
                        ip
                    ),
                    "",
                    0,
                ),
            );
        }
        endpoint
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn respond(&self, pattern: &str, result: ExecutionResult) {
        lock(&self.state)
            .responses
            .push((pattern.to_string(), result));
    }

    /// Every command run so far, unwrapped
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        lock(&self.state).commands.iter().any(|c| c.contains(needle))
    }

    pub fn copies(&self) -> Vec<(PathBuf, String)> {
        lock(&self.state).copies.clone()
    }

    /// Contents of files written with [`Endpoint::write_file`]
    pub fn written(&self, path: &str) -> Option<String> {
        lock(&self.state).written.get(path).cloned()
    }

    pub fn connected_as(&self) -> Option<String> {
        lock(&self.state).connected_as.clone()
    }

    fn record(&self, event: String) {
        if let Some(events) = &self.events {
            events.push(format!("{}: {}", self.hostname, event));
        }
    }
}

impl Endpoint for MockEndpoint {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn kind(&self) -> EndpointKind {
        self.kind
    }

    fn connect(&self, login: &LoginSpec) -> Result<()> {
        lock(&self.state).connected_as = Some(login.username.clone());
        Ok(())
    }

    fn run(&self, cmd: &str, _options: &RunOptions) -> Result<ExecutionResult> {
        let result = {
            let mut state = lock(&self.state);
            state.commands.push(cmd.to_string());
            state
                .responses
                .iter()
                .rev()
                .find(|(pattern, _)| cmd.contains(pattern.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_default()
        };
        self.record(cmd.to_string());
        Ok(result)
    }

    fn copy_to(&self, src: &Path, dst: &str) -> Result<()> {
        lock(&self.state).copies.push((src.to_path_buf(), dst.to_string()));
        self.record(format!("copy {} {}", src.display(), dst));
        Ok(())
    }

    fn write_file(&self, dst: &str, contents: &str) -> Result<()> {
        lock(&self.state)
            .written
            .insert(dst.to_string(), contents.to_string());
        self.record(format!("write {}", dst));
        Ok(())
    }
}

/// Registry whose endpoints are all [`MockEndpoint`]s, still reachable by type
pub struct MockHosts {
    pub registry: Arc<EndpointRegistry>,
    mocks: Arc<Mutex<HashMap<(EndpointKind, String), Arc<MockEndpoint>>>>,
}

impl MockHosts {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Every command on every host is also pushed to `events`
    pub fn with_events(events: EventLog) -> Self {
        Self::build(Some(events))
    }

    fn build(events: Option<EventLog>) -> Self {
        let mocks: Arc<Mutex<HashMap<(EndpointKind, String), Arc<MockEndpoint>>>> =
            Arc::default();
        let created = Arc::clone(&mocks);
        let registry = EndpointRegistry::new(Arc::new(move |kind: EndpointKind, host: &str| {
            let mut endpoint = MockEndpoint::new(host, kind);
            if let Some(events) = &events {
                endpoint = endpoint.with_events(events.clone());
            }
            let endpoint = Arc::new(endpoint);
            lock(&created).insert((kind, host.to_string()), Arc::clone(&endpoint));
            endpoint as Arc<dyn Endpoint>
        }));
        Self {
            registry: Arc::new(registry),
            mocks,
        }
    }

    /// Endpoint for `host` as the registry would hand it out, created on demand
    pub fn remote(&self, host: &str) -> Arc<MockEndpoint> {
        self.typed(self.registry.for_host(host))
    }

    pub fn local(&self) -> Arc<MockEndpoint> {
        self.typed(self.registry.local())
    }

    /// Endpoint for `host` only if something already looked it up
    pub fn existing(&self, host: &str) -> Option<Arc<MockEndpoint>> {
        let kind = if host == "localhost" {
            EndpointKind::Local
        } else {
            EndpointKind::Remote
        };
        lock(&self.mocks).get(&(kind, host.to_string())).cloned()
    }

    /// Commands issued across every host
    pub fn command_count(&self) -> usize {
        lock(&self.mocks).values().map(|m| m.commands().len()).sum()
    }

    fn typed(&self, endpoint: Arc<dyn Endpoint>) -> Arc<MockEndpoint> {
        let key = (endpoint.kind(), endpoint.hostname().to_string());
        match lock(&self.mocks).get(&key) {
            Some(mock) => Arc::clone(mock),
            None => unreachable!("registry handed out an endpoint it did not create"),
        }
    }
}

impl Default for MockHosts {
    fn default() -> Self {
        Self::new()
    }
}

/// Install backend with an in-memory inventory
///
/// Every host reports `known` unless told otherwise.
pub struct MockBackend {
    events: EventLog,
    inventory: Mutex<Vec<InventoryHost>>,
    statuses: Mutex<HashMap<String, String>>,
    api_vip: Mutex<Option<Ipv4Addr>>,
    ignition: Mutex<String>,
}

impl MockBackend {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            inventory: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            api_vip: Mutex::new(None),
            ignition: Mutex::new("{}".to_string()),
        }
    }

    pub fn set_inventory(&self, hosts: Vec<InventoryHost>) {
        *lock(&self.inventory) = hosts;
    }

    pub fn inventory(&self) -> Vec<InventoryHost> {
        lock(&self.inventory).clone()
    }

    pub fn set_status(&self, name: &str, status: &str) {
        lock(&self.statuses).insert(name.to_string(), status.to_string());
    }

    pub fn set_api_vip(&self, vip: Option<Ipv4Addr>) {
        *lock(&self.api_vip) = vip;
    }

    /// Discovery ignition written by `download_discovery_ignition`
    pub fn set_ignition(&self, ignition: &str) {
        *lock(&self.ignition) = ignition.to_string();
    }

    fn event(&self, what: String) {
        self.events.push(format!("backend: {}", what));
    }
}

impl InstallBackend for MockBackend {
    fn create_cluster(&self, config: &ClusterConfig) -> Result<()> {
        self.event(format!("create_cluster {}", config.name));
        Ok(())
    }

    fn ensure_cluster_deleted(&self, cluster: &str) -> Result<()> {
        self.event(format!("delete_cluster {}", cluster));
        Ok(())
    }

    fn ensure_infraenv_created(
        &self,
        infra_env: &str,
        _config: &ClusterConfig,
        arch: Arch,
    ) -> Result<()> {
        self.event(format!("create_infraenv {} {}", infra_env, arch));
        Ok(())
    }

    fn ensure_infraenv_deleted(&self, infra_env: &str) -> Result<()> {
        self.event(format!("delete_infraenv {}", infra_env));
        Ok(())
    }

    fn infra_env_id(&self, infra_env: &str) -> Result<Option<String>> {
        Ok(Some(format!("id-{}", infra_env)))
    }

    fn download_iso(&self, infra_env: &str, dir: &Path) -> Result<PathBuf> {
        self.event(format!("download_iso {}", infra_env));
        Ok(dir.join(format!("{}.iso", infra_env)))
    }

    fn start_until_success(&self, cluster: &str) -> Result<()> {
        self.event(format!("start {}", cluster));
        Ok(())
    }

    fn wait_cluster(&self, cluster: &str) -> Result<()> {
        self.event(format!("wait_cluster {}", cluster));
        Ok(())
    }

    fn host_status(&self, name: &str) -> Result<Option<String>> {
        Ok(Some(
            lock(&self.statuses)
                .get(name)
                .cloned()
                .unwrap_or_else(|| "known".to_string()),
        ))
    }

    fn list_hosts(&self) -> Result<Vec<InventoryHost>> {
        Ok(self.inventory())
    }

    fn update_host_name(&self, host_id: &str, name: &str) -> Result<()> {
        self.event(format!("rename {} {}", host_id, name));
        let mut inventory = lock(&self.inventory);
        match inventory.iter_mut().find(|h| h.id == host_id) {
            Some(host) => {
                host.name = name.to_string();
                Ok(())
            }
            None => Err(CdaError::Backend(format!("no host with id {}", host_id))),
        }
    }

    fn delete_host(&self, name: &str) -> Result<()> {
        self.event(format!("delete_host {}", name));
        Ok(())
    }

    fn download_kubeconfig(&self, cluster: &str, dest: &Path) -> Result<()> {
        self.event(format!("download_kubeconfig {} {}", cluster, dest.display()));
        Ok(())
    }

    fn download_kubeadmin_password(&self, cluster: &str, dest: &Path) -> Result<()> {
        self.event(format!("download_kubeadmin_password {} {}", cluster, dest.display()));
        Ok(())
    }

    fn download_discovery_ignition(&self, infra_env: &str, dir: &Path) -> Result<PathBuf> {
        self.event(format!("download_discovery_ignition {}", infra_env));
        let path = dir.join(format!("discovery.ign.{}", infra_env));
        std::fs::write(&path, lock(&self.ignition).as_str())?;
        Ok(path)
    }

    fn allow_add_workers(&self, cluster: &str) -> Result<()> {
        self.event(format!("allow_add_workers {}", cluster));
        Ok(())
    }

    fn start_infraenv(&self, infra_env: &str) -> Result<()> {
        self.event(format!("start_infraenv {}", infra_env));
        Ok(())
    }

    fn api_vip(&self, _cluster: &str) -> Result<Option<Ipv4Addr>> {
        Ok(*lock(&self.api_vip))
    }
}

/// Cluster API where every node is ready
pub struct MockClusterApi {
    events: EventLog,
    not_ready: Mutex<HashMap<String, usize>>,
}

impl MockClusterApi {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            not_ready: Mutex::new(HashMap::new()),
        }
    }

    /// Report `node` as not ready for the next `polls` readiness checks
    pub fn not_ready_for(&self, node: &str, polls: usize) {
        lock(&self.not_ready).insert(node.to_string(), polls);
    }
}

impl ClusterApi for MockClusterApi {
    fn is_ready(&self, node: &str) -> Result<bool> {
        let mut not_ready = lock(&self.not_ready);
        match not_ready.get_mut(node) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    fn approve_pending_csrs(&self) -> Result<usize> {
        self.events.push("cluster: approve_csrs");
        Ok(0)
    }

    fn delete_node(&self, node: &str) -> Result<()> {
        self.events.push(format!("cluster: delete_node {}", node));
        Ok(())
    }
}

pub struct MockDhcp {
    events: EventLog,
}

impl DhcpReservations for MockDhcp {
    fn upsert(&self, hostname: &str, mac: &str, ip: Ipv4Addr) -> Result<()> {
        self.events
            .push(format!("dhcp: {} {} {}", hostname, mac, ip));
        Ok(())
    }
}

pub struct MockBoot {
    events: EventLog,
}

impl BootController for MockBoot {
    fn boot_iso(&self, bmc: &BmcConfig, iso_url: &str) -> Result<()> {
        self.events.push(format!("boot: {} {}", bmc.address, iso_url));
        Ok(())
    }

    fn power_cycle(&self, bmc: &BmcConfig) -> Result<()> {
        self.events.push(format!("power_cycle: {}", bmc.address));
        Ok(())
    }
}

pub struct MockBridge {
    events: EventLog,
}

impl BridgeNetwork for MockBridge {
    fn configure(&self, host: &dyn Endpoint) -> Result<()> {
        self.events
            .push(format!("bridge: configure {}", host.hostname()));
        Ok(())
    }

    fn link(&self, host: &dyn Endpoint, _api_port: Option<&str>) -> Result<()> {
        self.events.push(format!("bridge: link {}", host.hostname()));
        Ok(())
    }

    fn unlink(&self, host: &dyn Endpoint, _api_port: Option<&str>) -> Result<()> {
        self.events.push(format!("bridge: unlink {}", host.hostname()));
        Ok(())
    }

    fn connect_external(&self, port: &str) -> Result<()> {
        self.events.push(format!("bridge: external {}", port));
        Ok(())
    }

    fn remove_dhcp_entries(&self, nodes: &[Node]) -> Result<()> {
        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        self.events
            .push(format!("bridge: remove_dhcp {}", names.join(",")));
        Ok(())
    }

    fn update_dns(&self, cluster: &str, api_vip: Option<Ipv4Addr>) -> Result<()> {
        let target = api_vip.map_or_else(|| "none".to_string(), |ip| ip.to_string());
        self.events
            .push(format!("bridge: dns {} {}", cluster, target));
        Ok(())
    }
}

pub struct MockExtraConfig {
    events: EventLog,
}

impl ExtraConfigRunner for MockExtraConfig {
    fn run(&self, step: &ExtraConfigStep) -> Result<()> {
        self.events.push(format!("extra: {}", step.name));
        Ok(())
    }
}

/// One mock per collaborator, all logging to `events`
pub struct MockServices {
    pub events: EventLog,
    pub backend: Arc<MockBackend>,
    pub cluster_api: Arc<MockClusterApi>,
}

impl MockServices {
    pub fn new() -> Self {
        Self::with_events(EventLog::new())
    }

    pub fn with_events(events: EventLog) -> Self {
        Self {
            backend: Arc::new(MockBackend::new(events.clone())),
            cluster_api: Arc::new(MockClusterApi::new(events.clone())),
            events,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            backend: Arc::clone(&self.backend) as Arc<dyn InstallBackend>,
            cluster_api: Arc::clone(&self.cluster_api) as Arc<dyn ClusterApi>,
            dhcp: Arc::new(MockDhcp {
                events: self.events.clone(),
            }),
            boot: Arc::new(MockBoot {
                events: self.events.clone(),
            }),
            bridge: Arc::new(MockBridge {
                events: self.events.clone(),
            }),
            extra: Arc::new(MockExtraConfig {
                events: self.events.clone(),
            }),
        }
    }
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}

/// A node on `host` with a fixed MAC and no reserved address
pub fn node_config(name: &str, kind: NodeKind, host: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        kind,
        host: host.to_string(),
        mac: "52:54:00:00:00:01".to_string(),
        ip: None,
        bmc: None,
        ram_mb: 32768,
        cpus: 8,
        disk_gb: 48,
    }
}

/// Valid openshift cluster of local VMs with zero poll intervals
///
/// Masters are `<name>-master-<i>` on 192.168.122.1i, workers
/// `<name>-worker-<i>` on 192.168.122.5i, numbered from 1.
pub fn cluster_config(name: &str, masters: usize, workers: usize) -> ClusterConfig {
    let mut config = match ClusterConfig::from_toml_str(&format!("name = \"{}\"", name)) {
        Ok(config) => config,
        Err(e) => panic!("minimal cluster config must parse: {}", e),
    };
    config.timing = TimingConfig::immediate();
    config.kubeconfig = Some(std::env::temp_dir().join(format!("cda-test-kubeconfig.{}", name)));
    if masters > 1 {
        config.api_vip = Some(Ipv4Addr::new(192, 168, 122, 99));
        config.ingress_vip = Some(Ipv4Addr::new(192, 168, 122, 98));
    }
    config.masters = (1..=masters)
        .map(|i| {
            let mut node = node_config(&format!("{}-master-{}", name, i), NodeKind::Vm, "localhost");
            node.mac = format!("52:54:00:00:01:{:02x}", i);
            node.ip = Some(Ipv4Addr::new(192, 168, 122, 10 + i as u8));
            node
        })
        .collect();
    config.workers = (1..=workers)
        .map(|i| {
            let mut node = node_config(&format!("{}-worker-{}", name, i), NodeKind::Vm, "localhost");
            node.mac = format!("52:54:00:00:02:{:02x}", i);
            node.ip = Some(Ipv4Addr::new(192, 168, 122, 50 + i as u8));
            node
        })
        .collect();
    config
}
