/*!
 * Nodes sharing one hosting machine, and the per-host provisioning actions
 *
 * Every action a `NodeGroup` issues goes through its host's endpoint, so
 * operations on one host execute in the order the group issues them.
 */

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use cda_core_resilience::{Poll, PollConfig, PollError, PollLoop};

use crate::boot::{strategy_for, BootEnv};
use crate::config::{HostConfig, IpRange};
use crate::error::{CdaError, Result};
use crate::exec::{quote, Endpoint, EndpointRegistry, LoginSpec, RunOptions};
use crate::node::{Node, NodeKind, NodeRole};
use crate::pool::{PendingResult, WorkerPool};
use crate::services::{BootController, BridgeNetwork, InstallBackend};

/// Power cycling of physical nodes that stay silent while booting
pub struct ColdBoot<'a> {
    pub boot: &'a dyn BootController,
    /// Silent polls before each cycle
    pub after_polls: u64,
    pub cycles: u32,
}

pub struct NodeGroup {
    name: String,
    api_port: Option<String>,
    pre_installed: bool,
    login: LoginSpec,
    endpoint: Arc<dyn Endpoint>,
    nodes: Vec<Node>,
}

impl NodeGroup {
    pub fn new(
        name: &str,
        host: Option<&HostConfig>,
        registry: &EndpointRegistry,
        discover_auth: bool,
        nodes: Vec<Node>,
    ) -> Self {
        let login = match host {
            Some(h) => LoginSpec::new(&h.username).with_password(h.password.as_deref()),
            None => LoginSpec::new("core"),
        }
        .with_discover_auth(discover_auth);

        Self {
            name: name.to_string(),
            api_port: host.and_then(|h| h.network_api_port.clone()),
            pre_installed: host.map_or(true, |h| h.pre_installed),
            login,
            endpoint: registry.for_host(name),
            nodes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn hosts_vms(&self) -> bool {
        self.nodes.iter().any(Node::is_vm)
    }

    pub fn connect(&self) -> Result<()> {
        self.endpoint.connect(&self.login)
    }

    pub fn configure_bridge(&self, bridge: &dyn BridgeNetwork) -> Result<()> {
        self.connect()?;
        bridge.configure(self.endpoint.as_ref())
    }

    pub fn ensure_linked(&self, bridge: &dyn BridgeNetwork) -> Result<()> {
        self.connect()?;
        bridge.link(self.endpoint.as_ref(), self.api_port.as_deref())
    }

    pub fn ensure_unlinked(&self, bridge: &dyn BridgeNetwork) -> Result<()> {
        self.connect()?;
        bridge.unlink(self.endpoint.as_ref(), self.api_port.as_deref())
    }

    /// Per-host preparation before any worker boots
    pub fn preinstall(&self) -> Result<()> {
        self.connect()?;
        if !self.pre_installed {
            warn!(
                "{}: host is not marked pre-installed; expecting it to be provisioned already",
                self.name
            );
        }
        if self.hosts_vms() {
            self.endpoint
                .run_or_die("systemctl enable --now libvirtd", &RunOptions::new().sudo())?;
        }
        Ok(())
    }

    /// Start every node of `role` on `pool`, one pending handle per node
    pub fn start_nodes(
        &self,
        role: NodeRole,
        pool: &WorkerPool,
        env: &BootEnv,
    ) -> Result<Vec<(String, PendingResult)>> {
        self.connect()?;
        let handles = self
            .nodes_with_role(role)
            .map(|node| {
                let node = node.clone();
                let endpoint = Arc::clone(&self.endpoint);
                let env = env.clone();
                info!("{}: starting {} {} ({})", self.name, role, node.name, node.kind);
                let name = node.name.clone();
                let handle = pool.spawn(move || strategy_for(node.kind).start(&node, endpoint.as_ref(), &env));
                (name, handle)
            })
            .collect();
        Ok(handles)
    }

    /// Block until every node of `role` has an address that answers
    ///
    /// Nodes with a reserved address are pinged from `local`. Nodes without
    /// one are looked up in the backend inventory, by name or by MAC since a
    /// freshly booted host still carries its discovery hostname, until an
    /// address inside `range` shows up. With `cold_boot`, a physical node that
    /// stays silent is power cycled through its BMC before waiting again.
    pub fn wait_for_boot(
        &mut self,
        role: NodeRole,
        local: &dyn Endpoint,
        backend: &dyn InstallBackend,
        range: &IpRange,
        poll: &PollConfig,
        cold_boot: Option<&ColdBoot<'_>>,
    ) -> Result<()> {
        for node in self.nodes.iter_mut().filter(|n| n.role == role) {
            info!("{}: waiting for {} to boot", node.name, role);
            let wanted = node.clone();
            let recovery = match (wanted.kind, &wanted.bmc, cold_boot) {
                (NodeKind::Physical, Some(bmc), Some(cb)) => Some((bmc, cb)),
                _ => None,
            };
            let step = |_: u64| -> Result<Poll<Ipv4Addr>> {
                let candidate = match wanted.ip {
                    Some(ip) => Some(ip),
                    None => inventory_address(backend, &wanted, range)?,
                };
                match candidate {
                    Some(ip) if local.ping(&ip.to_string())? => Ok(Poll::Ready(ip)),
                    _ => Ok(Poll::Pending),
                }
            };

            let mut cycles = 0;
            let ip = loop {
                let round = match recovery {
                    Some((_, cb)) if cycles < cb.cycles => {
                        let cap = poll.max_attempts.map_or(cb.after_polls, |m| m.min(cb.after_polls));
                        poll.clone().with_max_attempts(Some(cap))
                    }
                    _ => poll.clone(),
                };
                match PollLoop::new(round).run(&step) {
                    Ok(ip) => break ip,
                    Err(PollError::Aborted(e)) => return Err(e),
                    Err(e) => match recovery {
                        Some((bmc, cb)) if cycles < cb.cycles => {
                            cycles += 1;
                            warn!(
                                "{}: no answer ({}), power cycling through {} ({}/{})",
                                wanted.name, e, bmc.address, cycles, cb.cycles
                            );
                            cb.boot.power_cycle(bmc)?;
                        }
                        _ => {
                            return Err(CdaError::Exhausted(format!(
                                "{} did not boot: {}",
                                wanted.name, e
                            )))
                        }
                    },
                }
            };
            debug!("{} answers on {}", node.name, ip);
            node.observed_ip = Some(ip);
        }
        Ok(())
    }

    pub fn teardown_nodes(&self, role: NodeRole) -> Result<()> {
        let nodes: Vec<&Node> = self.nodes_with_role(role).collect();
        if nodes.is_empty() {
            return Ok(());
        }
        self.connect()?;
        for node in nodes {
            info!("{}: tearing down {}", self.name, node.name);
            strategy_for(node.kind).teardown(node, self.endpoint.as_ref())?;
        }
        Ok(())
    }

    /// Libvirt domains still defined on the host
    pub fn remaining_vms(&self) -> Result<Vec<String>> {
        self.connect()?;
        let result = self
            .endpoint
            .run_or_die("virsh list --all --name", &RunOptions::new().sudo().quiet())?;
        Ok(result.out.split_whitespace().map(str::to_string).collect())
    }

    /// Dump boot logs of the named nodes hosted here
    pub fn print_logs(&self, names: &[String]) {
        for node in self.nodes.iter().filter(|n| names.contains(&n.name)) {
            match strategy_for(node.kind).logs(node, self.endpoint.as_ref()) {
                Ok(Some(logs)) => info!("{} logs:\n{}", node.name, logs),
                Ok(None) => debug!("{}: no logs kept for {} nodes", node.name, node.kind),
                Err(e) => warn!("{}: could not collect logs: {}", node.name, e),
            }
        }
    }
}

/// First inventory address of `node` inside `range`
///
/// A host belongs to the node when it carries the node's name or reports an
/// interface with the node's MAC.
pub fn inventory_address(
    backend: &dyn InstallBackend,
    node: &Node,
    range: &IpRange,
) -> Result<Option<Ipv4Addr>> {
    Ok(backend
        .list_hosts()?
        .into_iter()
        .filter(|h| h.name == node.name || h.has_mac(&node.mac))
        .flat_map(|h| h.ipv4_addresses)
        .find(|ip| range.contains(*ip)))
}

/// Log into a booted node and set the root password
pub fn set_password(
    registry: &EndpointRegistry,
    node: &Node,
    login: &LoginSpec,
    password: &str,
) -> Result<()> {
    let ip = node
        .address()
        .ok_or_else(|| CdaError::Config(format!("{} has no known address", node.name)))?;
    let endpoint = registry.remote(&ip.to_string());
    endpoint.connect(login)?;
    info!("{}: setting root password", node.name);
    endpoint.run_or_die(
        &format!("echo root:{} | sudo chpasswd", quote(password)),
        &RunOptions::new().quiet(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{EndpointKind, ExecutionResult};
    use crate::services::InventoryHost;
    use crate::testing::{self, MockEndpoint, MockHosts};
    use std::time::Duration;

    fn group(hosts: &MockHosts, nodes: Vec<Node>) -> NodeGroup {
        let host = HostConfig {
            name: "h1".into(),
            username: "core".into(),
            password: None,
            network_api_port: Some("ens1f0".into()),
            pre_installed: true,
        };
        NodeGroup::new("h1", Some(&host), &hosts.registry, true, nodes)
    }

    fn worker(name: &str, ip: Option<Ipv4Addr>) -> Node {
        let mut config = testing::node_config(name, NodeKind::Vm, "h1");
        config.ip = ip;
        Node::from_config("c1", NodeRole::Worker, &config)
    }

    fn fast() -> PollConfig {
        PollConfig::every(Duration::ZERO).with_max_attempts(Some(5))
    }

    #[test]
    fn test_wait_for_boot_records_observed_ip() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![worker("w1", Some(Ipv4Addr::new(192, 168, 122, 51)))]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        let mocks = testing::MockServices::new();

        g.wait_for_boot(NodeRole::Worker, &local, mocks.backend.as_ref(), &IpRange::default(), &fast(), None)
            .unwrap();
        assert_eq!(g.nodes()[0].observed_ip, Some(Ipv4Addr::new(192, 168, 122, 51)));
        assert!(local.ran("ping -c 1 -W 1 192.168.122.51"));
    }

    #[test]
    fn test_wait_for_boot_uses_inventory_without_reserved_ip() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![worker("w1", None)]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        let mocks = testing::MockServices::new();
        mocks.backend.set_inventory(vec![InventoryHost {
            id: "x".into(),
            name: "w1".into(),
            ipv4_addresses: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 122, 77)],
            ..Default::default()
        }]);

        g.wait_for_boot(NodeRole::Worker, &local, mocks.backend.as_ref(), &IpRange::default(), &fast(), None)
            .unwrap();
        assert_eq!(g.nodes()[0].observed_ip, Some(Ipv4Addr::new(192, 168, 122, 77)));
    }

    #[test]
    fn test_wait_for_boot_finds_unrenamed_host_by_mac() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![worker("c1-worker-1", None)]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        let mocks = testing::MockServices::new();
        mocks.backend.set_inventory(vec![
            InventoryHost {
                id: "other".into(),
                name: "localhost.localdomain".into(),
                mac_addresses: vec!["52:54:00:00:00:99".into()],
                ipv4_addresses: vec![Ipv4Addr::new(192, 168, 122, 78)],
                ..Default::default()
            },
            InventoryHost {
                id: "x".into(),
                name: "localhost.localdomain".into(),
                mac_addresses: vec!["52:54:00:00:00:01".to_uppercase()],
                ipv4_addresses: vec![Ipv4Addr::new(192, 168, 122, 77)],
                ..Default::default()
            },
        ]);

        g.wait_for_boot(NodeRole::Worker, &local, mocks.backend.as_ref(), &IpRange::default(), &fast(), None)
            .unwrap();
        assert_eq!(g.nodes()[0].observed_ip, Some(Ipv4Addr::new(192, 168, 122, 77)));
        assert!(local.ran("ping -c 1 -W 1 192.168.122.77"));
        assert!(!local.ran("192.168.122.78"));
    }

    #[test]
    fn test_wait_for_boot_gives_up_when_bounded() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![worker("w1", Some(Ipv4Addr::new(192, 168, 122, 51)))]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        local.respond("ping", ExecutionResult::new("", "unreachable", 1));
        let mocks = testing::MockServices::new();

        let err = g
            .wait_for_boot(NodeRole::Worker, &local, mocks.backend.as_ref(), &IpRange::default(), &fast(), None)
            .unwrap_err();
        assert!(matches!(err, CdaError::Exhausted(_)));
    }

    fn physical(name: &str) -> Node {
        let mut config = testing::node_config(name, NodeKind::Physical, "h1");
        config.ip = Some(Ipv4Addr::new(192, 168, 122, 61));
        config.bmc = Some(crate::config::BmcConfig {
            address: "10.1.1.5".into(),
            user: "root".into(),
            password: "calvin".into(),
        });
        Node::from_config("c1", NodeRole::Worker, &config)
    }

    #[test]
    fn test_silent_physical_node_is_power_cycled() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![physical("bm1")]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        local.respond("ping", ExecutionResult::new("", "unreachable", 1));
        let mocks = testing::MockServices::new();
        let services = mocks.services();
        let cold_boot = ColdBoot {
            boot: services.boot.as_ref(),
            after_polls: 2,
            cycles: 2,
        };

        let err = g
            .wait_for_boot(
                NodeRole::Worker,
                &local,
                mocks.backend.as_ref(),
                &IpRange::default(),
                &fast(),
                Some(&cold_boot),
            )
            .unwrap_err();

        assert!(matches!(err, CdaError::Exhausted(_)));
        assert_eq!(mocks.events.count("power_cycle: 10.1.1.5"), 2);
        // Two silent rounds before each cycle, then the caller's own bound
        let pings = local.commands().iter().filter(|c| c.starts_with("ping")).count();
        assert_eq!(pings, 2 + 2 + 5);
    }

    #[test]
    fn test_answering_physical_node_is_not_cycled() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![physical("bm1")]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        let mocks = testing::MockServices::new();
        let services = mocks.services();
        let cold_boot = ColdBoot {
            boot: services.boot.as_ref(),
            after_polls: 1,
            cycles: 3,
        };

        g.wait_for_boot(
            NodeRole::Worker,
            &local,
            mocks.backend.as_ref(),
            &IpRange::default(),
            &fast(),
            Some(&cold_boot),
        )
        .unwrap();
        assert_eq!(g.nodes()[0].observed_ip, Some(Ipv4Addr::new(192, 168, 122, 61)));
        assert!(!mocks.events.contains("power_cycle"));
    }

    #[test]
    fn test_silent_vm_is_never_cycled() {
        let hosts = MockHosts::new();
        let mut g = group(&hosts, vec![worker("w1", Some(Ipv4Addr::new(192, 168, 122, 51)))]);
        let local = MockEndpoint::new("localhost", EndpointKind::Local);
        local.respond("ping", ExecutionResult::new("", "unreachable", 1));
        let mocks = testing::MockServices::new();
        let services = mocks.services();
        let cold_boot = ColdBoot {
            boot: services.boot.as_ref(),
            after_polls: 1,
            cycles: 3,
        };

        let err = g
            .wait_for_boot(
                NodeRole::Worker,
                &local,
                mocks.backend.as_ref(),
                &IpRange::default(),
                &fast(),
                Some(&cold_boot),
            )
            .unwrap_err();
        assert!(matches!(err, CdaError::Exhausted(_)));
        assert!(!mocks.events.contains("power_cycle"));
    }

    #[test]
    fn test_remaining_vms_and_preinstall() {
        let hosts = MockHosts::new();
        let g = group(&hosts, vec![worker("w1", None)]);
        let endpoint = hosts.remote("h1");
        endpoint.respond("virsh list --all --name", ExecutionResult::new("a\nb\n\n", "", 0));

        assert_eq!(g.remaining_vms().unwrap(), vec!["a", "b"]);
        g.preinstall().unwrap();
        assert!(endpoint.ran("systemctl enable --now libvirtd"));
        assert_eq!(endpoint.connected_as().as_deref(), Some("core"));
    }

    #[test]
    fn test_set_password_connects_to_node_address() {
        let hosts = MockHosts::new();
        let mut node = worker("w1", Some(Ipv4Addr::new(192, 168, 122, 51)));
        node.observed_ip = Some(Ipv4Addr::new(192, 168, 122, 52));
        set_password(&hosts.registry, &node, &LoginSpec::new("core"), "redhat").unwrap();

        assert!(hosts.remote("192.168.122.52").ran("echo root:redhat | sudo chpasswd"));
        assert!(hosts.existing("192.168.122.51").is_none());
    }
}
