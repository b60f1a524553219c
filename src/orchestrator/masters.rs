//! Master provisioning and the single-node ISO deploy
//!
//! The bridge must be configured and linked before any master boots, since
//! booting masters get their address from the local DHCP server. Hosts are
//! attached to the external network only after the install completed, so the
//! backend does not discover extra nodes on it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{info, warn};

use cda_core_resilience::PollConfig;

use super::Orchestrator;
use crate::config::{ClusterKind, Phase};
use crate::error::{CdaError, Result};
use crate::exec::RunOptions;
use crate::node::{Arch, Node, NodeRole};
use crate::node_group::set_password;
use crate::pool::{fan_out, join_all, WorkerPool};

const ETC_HOSTS: &str = "/etc/hosts";

impl Orchestrator {
    pub(super) fn create_cluster(&self) -> Result<()> {
        if self.masters.is_empty() {
            info!("create cluster: skip without masters");
            return Ok(());
        }
        if !self.steps.contains(Phase::Masters) {
            info!("create cluster: skip {} step", Phase::Masters);
            return Ok(());
        }
        info!("create cluster: start");
        self.services.backend.create_cluster(&self.config)
    }

    pub(super) fn create_masters(&mut self) -> Result<()> {
        if self.masters.is_empty() {
            info!("create masters: skip without masters");
            return Ok(());
        }
        if !self.steps.contains(Phase::Masters) {
            info!("create masters: skip {} step", Phase::Masters);
            return Ok(());
        }
        info!("create masters: start");

        let cluster = self.config.name.clone();
        let infra_env = format!("{}-{}", cluster, Arch::X86_64);
        info!("Ensuring infraenv {} exists", infra_env);
        self.services
            .backend
            .ensure_infraenv_created(&infra_env, &self.config, Arch::X86_64)?;

        let mut groups = self.groups(&self.masters);
        let services = self.services.clone();
        let bridge = services.bridge.as_ref();
        let dhcp = services.dhcp.as_ref();

        fan_out(&groups, |g| g.configure_bridge(bridge))?;
        fan_out(&self.masters, |n: &Node| match n.ip {
            Some(ip) => dhcp.upsert(&n.name, &n.mac, ip),
            None => Ok(()),
        })?;
        fan_out(&groups, |g| g.ensure_linked(bridge))?;

        let iso = self
            .services
            .backend
            .download_iso(&infra_env, &self.config.iso_dir)?;
        let env = self.boot_env(iso);

        let pool = WorkerPool::new(self.masters.len())?;
        for group in &groups {
            self.pending
                .extend(group.start_nodes(NodeRole::Master, &pool, &env)?);
        }

        let boot_poll = PollConfig::every(self.config.timing.boot_poll());
        let cold_boot = self.cold_boot();
        for group in &mut groups {
            group.wait_for_boot(
                NodeRole::Master,
                self.local.as_ref(),
                self.services.backend.as_ref(),
                &self.config.reserved_range,
                &boot_poll,
                cold_boot.as_ref(),
            )?;
        }
        Self::record_observed(&mut self.masters, &groups);

        let names: Vec<String> = self.masters.iter().map(|n| n.name.clone()).collect();
        self.wait_known(&names, &groups)?;

        info!("Starting cluster {} install", cluster);
        self.services.backend.start_until_success(&cluster)?;
        let kubeconfig = self.config.kubeconfig_path();
        info!("Downloading kubeconfig to {}", kubeconfig.display());
        self.services
            .backend
            .download_kubeconfig(&cluster, &kubeconfig)?;
        self.services
            .backend
            .download_kubeadmin_password(&cluster, &self.config.kubeadmin_password_path())?;
        self.services.backend.wait_cluster(&cluster)?;

        let api = self.api_address()?;
        match api {
            Some(ip) => self.update_etc_hosts(ip)?,
            None => warn!("No API address known for {}, /etc/hosts left alone", cluster),
        }

        join_all(&mut self.pending)?;

        fan_out(&groups, |g| g.ensure_linked(bridge))?;
        if self.need_external_network() {
            let port = self.external_port()?;
            info!("Connecting external port {} to the cluster bridge", port);
            bridge.connect_external(port)?;
        }

        let login = self.node_login();
        let password = self.config.node_root_password.as_str();
        let registry = self.registry.as_ref();
        fan_out(&self.masters, |n: &Node| {
            set_password(registry, n, &login, password)
        })?;

        if let Some(ip) = api {
            bridge.update_dns(&cluster, Some(ip))?;
        }
        info!("create masters: done");
        Ok(())
    }

    /// Point `api.<cluster>.<domain>` at `api_vip` in the local hosts file
    ///
    /// libvirt's dnsmasq serves names from /etc/hosts and only rereads it on
    /// restart.
    fn update_etc_hosts(&self, api_vip: Ipv4Addr) -> Result<()> {
        let api_name = format!("api.{}.{}", self.config.name, self.config.base_dns_domain);
        info!("Adding {} {} to {}", api_vip, api_name, ETC_HOSTS);
        let current = self.local.read_file(ETC_HOSTS)?;
        let updated = rewrite_hosts(&current, &api_name, api_vip);
        self.local.write_file(ETC_HOSTS, &updated)?;
        self.local
            .run_or_die("systemctl restart libvirtd", &RunOptions::new().sudo())?;
        Ok(())
    }

    pub(super) fn deploy_iso(&mut self) -> Result<()> {
        if !self.steps.contains(Phase::Masters) {
            info!("deploy cluster: skip {} step", Phase::Masters);
            return Ok(());
        }
        debug_assert_eq!(self.config.kind, ClusterKind::Iso);

        let master = self
            .masters
            .first()
            .ok_or_else(|| CdaError::Config("iso clusters need exactly one master".to_string()))?;
        let iso = self
            .config
            .install_iso
            .as_deref()
            .ok_or_else(|| CdaError::Config("install_iso is required for iso clusters".to_string()))?;
        info!("create cluster: start iso deploy (kind {})", master.kind);

        let env = self.boot_env(PathBuf::from(iso));
        let groups = self.groups(&self.masters);
        let pool = WorkerPool::new(1)?;
        for group in &groups {
            for (name, handle) in group.start_nodes(NodeRole::Master, &pool, &env)? {
                handle.join()?;
                info!("{} booted from {}", name, iso);
            }
        }
        Ok(())
    }
}

/// Hosts file contents with `name` mapped to `address` only
///
/// Every existing line naming `name` or mapping `address` is dropped.
pub fn rewrite_hosts(contents: &str, name: &str, address: Ipv4Addr) -> String {
    let address = address.to_string();
    let mut out: String = contents
        .lines()
        .filter(|line| {
            let entry = line.split('#').next().unwrap_or_default();
            let mut fields = entry.split_whitespace();
            match fields.next() {
                Some(addr) => addr != address && !fields.any(|f| f == name),
                None => true,
            }
        })
        .map(|line| format!("{}\n", line))
        .collect();
    out.push_str(&format!("{} {}\n", address, name));
    out
}
