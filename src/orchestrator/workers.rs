//! Worker provisioning
//!
//! Workers join a running cluster through their own infra-env. After boot
//! each worker is matched to its backend inventory entry by address and
//! renamed, then the orchestrator waits for the cluster API to report every
//! worker ready while approving certificate requests.

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use cda_core_resilience::{Poll, PollConfig, PollError, PollLoop};

use super::Orchestrator;
use crate::config::Phase;
use crate::error::{CdaError, Result};
use crate::exec::{quote, Endpoint, RunOptions};
use crate::node::{Arch, Node, NodeKind, NodeRole};
use crate::node_group::{inventory_address, set_password};
use crate::pool::{fan_out, join_all, WorkerPool};
use crate::services::InstallBackend;

const CORRUPT_STORAGE: &str = "A storage corruption might have occurred";

fn missing_layer_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Top layer (\w+) of image (\w+) not found in layer tree")
            .unwrap_or_else(|e| unreachable!("static regex: {}", e))
    })
}

#[derive(Debug, Deserialize)]
struct PodmanImage {
    #[serde(rename = "Id")]
    id: String,
}

impl Orchestrator {
    fn workers_arch(&self) -> Arch {
        if self.config.has_accelerator_workers() {
            Arch::Arm64
        } else {
            Arch::X86_64
        }
    }

    pub(super) fn create_workers(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            info!("Setting up workers: no worker to setup");
            return Ok(());
        }
        if self.masters.is_empty() {
            info!("Setting up workers: skip without masters");
            return Ok(());
        }
        if !self.steps.contains(Phase::Workers) {
            info!("Setting up workers: skip \"{}\" step", Phase::Workers);
            return Ok(());
        }
        info!("Setting up workers");

        let cluster = self.config.name.clone();
        let arch = self.workers_arch();
        let infra_env = format!("{}-{}", cluster, arch);
        let services = self.services.clone();
        let backend = services.backend.as_ref();
        let bridge = services.bridge.as_ref();
        let dhcp = services.dhcp.as_ref();

        backend.allow_add_workers(&cluster)?;
        backend.ensure_infraenv_created(&infra_env, &self.config, arch)?;

        let mut groups = self.groups(&self.workers);
        fan_out(&groups, |g| g.configure_bridge(bridge))?;
        fan_out(&self.workers, |n: &Node| match n.ip {
            Some(ip) => dhcp.upsert(&n.name, &n.mac, ip),
            None => Ok(()),
        })?;
        fan_out(&groups, |g| g.ensure_linked(bridge))?;

        info!("Preinstalling {} hosts", groups.len());
        fan_out(&groups, |g| g.preinstall())?;

        let iso = backend.download_iso(&infra_env, &self.config.iso_dir)?;
        let mut env = self.boot_env(iso);
        env.ssh_key = self.discovery_key(&infra_env)?;

        let pool = WorkerPool::new(self.workers.len())?;
        for group in &groups {
            self.pending
                .extend(group.start_nodes(NodeRole::Worker, &pool, &env)?);
        }

        let boot_poll = PollConfig::every(self.config.timing.boot_poll());
        let cold_boot = self.cold_boot();
        for group in &mut groups {
            group.wait_for_boot(
                NodeRole::Worker,
                self.local.as_ref(),
                backend,
                &self.config.reserved_range,
                &boot_poll,
                cold_boot.as_ref(),
            )?;
        }
        Self::record_observed(&mut self.workers, &groups);

        info!("renaming workers");
        self.correlate(&infra_env)?;

        let names: Vec<String> = self.workers.iter().map(|n| n.name.clone()).collect();
        self.wait_known(&names, &groups)?;

        info!("starting infra env {}", infra_env);
        backend.start_infraenv(&infra_env)?;
        info!("waiting for workers to be ready");
        self.wait_for_workers()?;

        let login = self.node_login();
        let password = self.config.node_root_password.as_str();
        let registry = self.registry.as_ref();
        fan_out(&self.workers, |n: &Node| {
            set_password(registry, n, &login, password)
        })?;

        join_all(&mut self.pending)
    }

    /// Match booted workers to their inventory entries and rename them
    ///
    /// Every worker must first answer on an address inside the reserved
    /// range; a worker that does not is a fatal misconfiguration.
    fn correlate(&self, infra_env: &str) -> Result<()> {
        info!("Waiting for connectivity to all workers");
        let range = self.config.reserved_range;
        let login = self.node_login();
        let registry = self.registry.as_ref();

        let mut expected = Vec::with_capacity(self.workers.len());
        let mut bad = Vec::new();
        for worker in &self.workers {
            let ip = worker.address().ok_or_else(|| {
                CdaError::Correlation(format!("{} has no known address", worker.name))
            })?;
            let endpoint = registry.remote(&ip.to_string());
            endpoint.connect(&login)?;
            let listing = endpoint.run_or_die("ip -4 -o addr show", &RunOptions::new().quiet())?;
            if parse_inet_addresses(&listing.out)
                .into_iter()
                .any(|a| range.contains(a))
            {
                expected.push((worker.name.clone(), ip));
            } else {
                warn!(
                    "Worker {} doesn't have an IP in range {}-{}",
                    worker.name, range.start, range.end
                );
                bad.push(worker.name.clone());
            }
        }
        if !bad.is_empty() {
            return Err(CdaError::Correlation(format!(
                "no address in {}-{} on {}",
                range.start,
                range.end,
                bad.join(", ")
            )));
        }

        info!("Connectivity established to all workers, renaming them in the backend");
        let poll = PollConfig::every(self.config.timing.correlation_poll())
            .with_max_attempts(self.config.timing.correlation_max_attempts);
        rename_workers(self.services.backend.as_ref(), infra_env, &expected, &poll)
    }

    /// Poll the cluster API until every worker is ready
    ///
    /// Pending certificate requests are approved on every pass. Accelerator
    /// workers get a root password as soon as the backend reports their
    /// address, and from then on have their clock synced and broken image
    /// layers pruned each pass.
    fn wait_for_workers(&self) -> Result<()> {
        let total = self.workers.len();
        info!("waiting for {} workers", total);
        let api = self.services.cluster_api.as_ref();
        let backend = self.services.backend.as_ref();
        let accelerators: Vec<&Node> = self
            .workers
            .iter()
            .filter(|w| w.kind == NodeKind::Accelerator)
            .collect();
        let login = self.node_login();
        let mut connections: BTreeMap<String, Arc<dyn Endpoint>> = BTreeMap::new();
        let mut prev_ready = 0;

        let poll = PollConfig::every(self.config.timing.worker_ready_poll());
        let result = PollLoop::new(poll).run(|attempt| -> Result<Poll<()>> {
            let mut ready = 0;
            for worker in &self.workers {
                if api.is_ready(&worker.name)? {
                    ready += 1;
                }
            }
            if ready != prev_ready {
                info!("{}/{} is ready (try #{})", ready, total, attempt);
                prev_ready = ready;
            }
            if ready == total {
                return Ok(Poll::Ready(()));
            }

            let approved = api.approve_pending_csrs()?;
            if approved > 0 {
                debug!("approved {} certificate requests", approved);
            }

            let unconnected: Vec<&Node> = accelerators
                .iter()
                .copied()
                .filter(|n| !connections.contains_key(&n.name))
                .collect();
            for node in unconnected {
                let Some(ip) = inventory_address(backend, node, &self.config.reserved_range)?
                else {
                    continue;
                };
                let endpoint = self.registry.remote(&ip.to_string());
                endpoint.connect(&login)?;
                info!("connected to {}, setting user:pw", node.name);
                endpoint.run(
                    &format!(
                        "echo root:{} | sudo chpasswd",
                        quote(&self.config.node_root_password)
                    ),
                    &RunOptions::new().quiet(),
                )?;
                connections.insert(node.name.clone(), endpoint);
            }

            for (name, endpoint) in &connections {
                sync_time(self.local.as_ref(), endpoint.as_ref())?;
                prune_corrupted_images(name, endpoint.as_ref())?;
            }
            Ok(Poll::Pending)
        });

        match result {
            Ok(()) => Ok(()),
            Err(PollError::Aborted(e)) => Err(e),
            Err(e) => Err(CdaError::Exhausted(format!("workers not ready: {}", e))),
        }
    }
}

/// IPv4 addresses in `ip -4 -o addr show` output, prefix length stripped
pub fn parse_inet_addresses(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|f| *f == "inet")?;
            let cidr = fields.next()?;
            cidr.split('/').next()?.parse().ok()
        })
        .collect()
}

/// Rename inventory hosts of `infra_env` after the worker whose address they report
///
/// Runs full passes over the inventory until every `(name, address)` pair in
/// `expected` was matched. Each worker is renamed exactly once.
pub fn rename_workers(
    backend: &dyn InstallBackend,
    infra_env: &str,
    expected: &[(String, Ipv4Addr)],
    poll: &PollConfig,
) -> Result<()> {
    let addresses: Vec<Ipv4Addr> = expected.iter().map(|(_, ip)| *ip).collect();
    info!("looking for workers with ip {:?}", addresses);
    let mut renamed: HashSet<String> = HashSet::new();

    let result = PollLoop::new(poll.clone()).run(|attempt| -> Result<Poll<()>> {
        let infra_env_id = backend.infra_env_id(infra_env)?;
        let hosts = backend.list_hosts()?;
        for host in hosts
            .iter()
            .filter(|h| infra_env_id.is_some() && h.infra_env_id == infra_env_id)
        {
            let matched = expected
                .iter()
                .filter(|(name, _)| !renamed.contains(name))
                .find(|(_, ip)| host.ipv4_addresses.contains(ip));
            if let Some((name, _)) = matched {
                backend.update_host_name(&host.id, name)?;
                info!("renamed {}", name);
                renamed.insert(name.clone());
            }
        }

        if renamed.len() == expected.len() {
            info!("Found and renamed {} workers", renamed.len());
            return Ok(Poll::Ready(()));
        }
        if !renamed.is_empty() {
            info!(
                "Found and renamed {} workers, but waiting for {}, retrying (try #{})",
                renamed.len(),
                expected.len(),
                attempt
            );
        }
        Ok(Poll::Pending)
    });

    match result {
        Ok(()) => Ok(()),
        Err(PollError::Aborted(e)) => Err(e),
        Err(e) => Err(CdaError::Correlation(format!(
            "renamed {} of {} workers: {}",
            renamed.len(),
            expected.len(),
            e
        ))),
    }
}

/// Set the clock on `remote` to the local time
fn sync_time(local: &dyn Endpoint, remote: &dyn Endpoint) -> Result<()> {
    let now = local.run_or_die("date", &RunOptions::new().quiet())?;
    remote.run(
        &format!("date -s {}", quote(now.out.trim())),
        &RunOptions::new().sudo().quiet(),
    )?;
    Ok(())
}

/// Remove images whose storage is broken so pulls can be retried
fn prune_corrupted_images(node: &str, host: &dyn Endpoint) -> Result<()> {
    let sudo = RunOptions::new().sudo();
    let listing = host.run("podman images", &sudo.clone().quiet())?;
    let text = format!("{}{}", listing.out, listing.err);
    if let Some(caps) = missing_layer_regex().captures(&text) {
        warn!("Removing corrupt image from worker {}", node);
        let rmi = host.run(&format!("podman rmi {}", quote(&caps[2])), &sudo)?;
        warn!("{}", rmi);
    }

    let json = host.run("podman images --format json", &sudo.clone().quiet())?;
    if !json.success() {
        return Ok(());
    }
    let images: Vec<PodmanImage> = match serde_json::from_str(&json.out) {
        Ok(images) => images,
        Err(e) => {
            info!("{}: unreadable image list: {}", node, e);
            return Ok(());
        }
    };
    for image in images {
        let inspect = host.run(
            &format!("podman image inspect {}", quote(&image.id)),
            &sudo.clone().quiet(),
        )?;
        if inspect.out.contains(CORRUPT_STORAGE) || inspect.err.contains(CORRUPT_STORAGE) {
            warn!("Corrupt image {} found on {}", image.id, node);
            host.run(&format!("podman rmi {}", quote(&image.id)), &sudo)?;
        }
    }
    Ok(())
}
