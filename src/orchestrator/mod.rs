/*!
 * Deployment and teardown state machine
 *
 * The orchestrator owns the node inventory and the selected step set, builds
 * one [`NodeGroup`] per hosting machine and drives the phases in their fixed
 * order. Per-host work fans out on rayon pools; every fan-out is a barrier,
 * so no operation of a later phase starts before the previous one finished.
 *
 * A deploy runs:
 *
 * 1. pre-flight checks on the local host
 * 2. preconfig steps
 * 3. worker teardown and master teardown, skipped when there is nothing to do
 * 4. the cluster-kind specific deploy (masters, then workers)
 * 5. postconfig steps
 */

mod masters;
mod teardown;
mod workers;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use cda_core_resilience::{wait_known_state, KnownStateError, PollConfig};

use crate::boot::{BootEnv, BootMedia};
use crate::config::{ClusterConfig, ClusterKind, ExtraConfigStep, Phase, StepSet};
use crate::error::{CdaError, Result};
use crate::exec::connection::{default_key_paths, ignition_authorized_keys, matching_private_key};
use crate::exec::{quote, Endpoint, EndpointRegistry, LoginSpec, RunOptions};
use crate::node::Node;
use crate::node_group::{ColdBoot, NodeGroup};
use crate::pool::{take_failure, PendingMap, PendingResult};
use crate::services::Services;

pub use masters::rewrite_hosts;
pub use workers::{parse_inet_addresses, rename_workers};

pub struct Orchestrator {
    config: Arc<ClusterConfig>,
    steps: StepSet,
    services: Services,
    registry: Arc<EndpointRegistry>,
    local: Arc<dyn Endpoint>,
    masters: Vec<Node>,
    workers: Vec<Node>,
    /// In-flight provisioning action per node name
    pending: PendingMap,
    /// Private keys that may pair with the discovery image's authorized key
    ssh_keys: Vec<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        config: ClusterConfig,
        steps: StepSet,
        services: Services,
        registry: Arc<EndpointRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        if config.is_sno() {
            info!("Setting up a single node cluster");
        }

        let masters = config.master_nodes();
        let workers = config.worker_nodes();
        let pending = masters
            .iter()
            .chain(workers.iter())
            .map(|n| (n.name.clone(), PendingResult::completed()))
            .collect();

        Ok(Self {
            local: registry.local(),
            config: Arc::new(config),
            steps,
            services,
            registry,
            masters,
            workers,
            pending,
            ssh_keys: default_key_paths(),
        })
    }

    /// Candidate private keys for accelerator nodes (default: the keys in ~/.ssh)
    pub fn with_ssh_keys(mut self, keys: Vec<PathBuf>) -> Self {
        self.ssh_keys = keys;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn masters(&self) -> &[Node] {
        &self.masters
    }

    pub fn workers(&self) -> &[Node] {
        &self.workers
    }

    pub fn deploy(&mut self) -> Result<()> {
        info!("Deploying cluster {} (steps: {})", self.config.name, self.steps);
        self.preflight()?;
        self.preconfig()?;
        self.teardown_workers(false)?;
        self.teardown_masters(false)?;
        self.deploy_cluster()?;
        self.postconfig()?;
        info!("Cluster {} deployed", self.config.name);
        Ok(())
    }

    /// Tear the cluster down; with `workers_only` the masters are left alone
    pub fn teardown(&mut self, workers_only: bool) -> Result<()> {
        info!("Tearing down cluster {}", self.config.name);
        self.teardown_workers(true)?;
        if !workers_only {
            self.teardown_masters(true)?;
        }
        Ok(())
    }

    /// Checks on the local host that must pass before any phase runs
    pub fn preflight(&self) -> Result<()> {
        if self.config.kind != ClusterKind::OpenShift {
            return Ok(());
        }

        let nproc = self.local.run_or_die("nproc", &RunOptions::new().quiet())?;
        let cores: u32 = nproc
            .out
            .trim()
            .parse()
            .map_err(|e| CdaError::Parse(format!("nproc output {:?}: {}", nproc.out.trim(), e)))?;
        if cores < self.config.min_local_cores {
            return Err(CdaError::Config(format!(
                "Detected {} cores on localhost, but need at least {} cores",
                cores, self.config.min_local_cores
            )));
        }

        if self.need_external_network() {
            let port = self.external_port()?;
            let link = self
                .local
                .run(&format!("ip link show {}", quote(port)), &RunOptions::new().quiet())?;
            if !link.success() {
                return Err(CdaError::Config(format!(
                    "Invalid external port {}: {}",
                    port,
                    link.err.trim()
                )));
            }
        } else {
            info!("Don't need external network so will not set it up");
        }
        Ok(())
    }

    /// Whether any selected node lives outside the local bridge
    pub fn need_external_network(&self) -> bool {
        let off_bridge = |n: &Node| !n.is_vm() || n.host != "localhost";
        let masters = self.steps.contains(Phase::Masters) && self.masters.iter().any(off_bridge);
        let remote_workers =
            self.steps.contains(Phase::Workers) && self.workers.iter().any(|n| !n.is_vm());
        let remote_vm_workers = self.workers.iter().any(|n| n.is_vm() && n.host != "localhost");
        masters || remote_workers || remote_vm_workers
    }

    fn external_port(&self) -> Result<&str> {
        self.config
            .external_port
            .as_deref()
            .ok_or_else(|| CdaError::Config("external_port is required for remote nodes".to_string()))
    }

    /// Address the cluster API answers on
    pub fn api_address(&self) -> Result<Option<Ipv4Addr>> {
        if let Some(vip) = self.config.api_vip {
            return Ok(Some(vip));
        }
        if let Some(vip) = self.services.backend.api_vip(&self.config.name)? {
            return Ok(Some(vip));
        }
        if self.config.is_sno() {
            return Ok(self.masters.first().and_then(Node::address));
        }
        Ok(None)
    }

    fn preconfig(&self) -> Result<()> {
        if self.masters.is_empty() {
            info!("preconfig step: skipping without masters");
            return Ok(());
        }
        if !self.steps.contains(Phase::Pre) {
            info!("preconfig step: skip {} step", Phase::Pre);
            return Ok(());
        }
        info!("preconfig step: start");
        self.run_extra_config(&self.config.preconfig)
    }

    fn postconfig(&self) -> Result<()> {
        if !self.steps.contains(Phase::Post) {
            info!("postconfig step: skip {} step", Phase::Post);
            return Ok(());
        }
        info!("postconfig step: start");
        self.run_extra_config(&self.config.postconfig)
    }

    fn run_extra_config(&self, steps: &[ExtraConfigStep]) -> Result<()> {
        for step in steps {
            info!("Running extra config {}", step.name);
            self.services.extra.run(step)?;
        }
        Ok(())
    }

    fn deploy_cluster(&mut self) -> Result<()> {
        match self.config.kind {
            ClusterKind::Iso => self.deploy_iso(),
            ClusterKind::OpenShift => {
                info!("deploy cluster: start openshift deploy");
                self.create_cluster()?;
                self.create_masters()?;
                self.create_workers()
            }
        }
    }

    /// One group per hosting machine, in first-seen order
    fn groups(&self, nodes: &[Node]) -> Vec<NodeGroup> {
        let mut by_host: BTreeMap<&str, Vec<Node>> = BTreeMap::new();
        let mut order: Vec<&str> = Vec::new();
        for node in nodes {
            if !by_host.contains_key(node.host.as_str()) {
                order.push(&node.host);
            }
            by_host.entry(&node.host).or_default().push(node.clone());
        }

        order
            .into_iter()
            .map(|host| {
                NodeGroup::new(
                    host,
                    self.config.host_config(host),
                    &self.registry,
                    self.config.discover_auth,
                    by_host.remove(host).unwrap_or_default(),
                )
            })
            .collect()
    }

    fn boot_env(&self, iso: PathBuf) -> BootEnv {
        BootEnv {
            services: self.services.clone(),
            cluster: Arc::clone(&self.config),
            media: BootMedia::new(iso, self.config.iso_base_url.as_deref()),
            ssh_key: self.first_ssh_key(),
        }
    }

    fn cold_boot(&self) -> Option<ColdBoot<'_>> {
        let timing = &self.config.timing;
        timing.cold_boot_after_polls.map(|after_polls| ColdBoot {
            boot: self.services.boot.as_ref(),
            after_polls,
            cycles: timing.cold_boot_cycles,
        })
    }

    fn first_ssh_key(&self) -> Option<PathBuf> {
        self.ssh_keys.iter().find(|p| p.exists()).cloned()
    }

    /// Private key matching the key the infra-env's discovery image authorizes
    ///
    /// Falls back to the first existing candidate when none matches.
    fn discovery_key(&self, infra_env: &str) -> Result<Option<PathBuf>> {
        if !self.ssh_keys.iter().any(|p| p.exists()) {
            return Ok(None);
        }
        let dir = tempfile::tempdir()?;
        let path = self
            .services
            .backend
            .download_discovery_ignition(infra_env, dir.path())?;
        let authorized = ignition_authorized_keys(&std::fs::read_to_string(&path)?)?;
        info!("Discovery image for {} authorizes {:?}", infra_env, authorized);

        match matching_private_key(&authorized, &self.ssh_keys)? {
            Some(key) => {
                info!("Found matching private key at {}", key.display());
                Ok(Some(key))
            }
            None => {
                let fallback = self.first_ssh_key();
                warn!(
                    "No local key matches the discovery image of {}, using {:?}",
                    infra_env, fallback
                );
                Ok(fallback)
            }
        }
    }

    /// Login used on freshly installed nodes
    fn node_login(&self) -> LoginSpec {
        LoginSpec::new(&self.config.node_username).with_discover_auth(self.config.discover_auth)
    }

    /// Block until the backend reports every node in `names` as known
    ///
    /// Failed start actions in the pending map abort the wait early. When a
    /// node reports the error status, the logs of every node are dumped first.
    fn wait_known(&mut self, names: &[String], groups: &[NodeGroup]) -> Result<()> {
        let backend = Arc::clone(&self.services.backend);
        let poll = PollConfig::every(self.config.timing.known_state_poll());
        let pending = &mut self.pending;

        let result = wait_known_state(
            names,
            &poll,
            |name| backend.host_status(name),
            || match take_failure(pending) {
                Some(e) => Err(e),
                None => Ok(()),
            },
        );

        match result {
            Ok(_) => Ok(()),
            Err(KnownStateError::NodeError { failed }) => {
                for group in groups {
                    group.print_logs(names);
                }
                Err(CdaError::NodeError { nodes: failed })
            }
            Err(KnownStateError::Lookup(e)) => Err(e),
            Err(KnownStateError::Exhausted { attempts }) => Err(CdaError::Exhausted(format!(
                "{:?} not known after {} polls",
                names, attempts
            ))),
        }
    }

    /// Copy observed addresses from `groups` back into `nodes`
    fn record_observed(nodes: &mut [Node], groups: &[NodeGroup]) {
        for seen in groups.iter().flat_map(|g| g.nodes()) {
            if let Some(node) = nodes.iter_mut().find(|n| n.name == seen.name) {
                if seen.observed_ip.is_some() {
                    node.observed_ip = seen.observed_ip;
                }
            }
        }
    }
}
