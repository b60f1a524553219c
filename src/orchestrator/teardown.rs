//! Cluster teardown
//!
//! Masters come down in dependency order: backend records, DNS and DHCP
//! entries, the nodes themselves, the image pool, bridge links and finally
//! the stored kubeconfig. Workers are torn down first whenever both go.

use std::collections::HashSet;
use std::io;
use tracing::{debug, info};

use super::Orchestrator;
use crate::config::{ClusterKind, Phase};
use crate::error::Result;
use crate::exec::{quote, RunOptions};
use crate::node::{image_dir, Arch, NodeRole};
use crate::pool::fan_out;

impl Orchestrator {
    pub(super) fn teardown_masters(&mut self, force: bool) -> Result<()> {
        let cluster = self.config.name.clone();
        if self.config.kind != ClusterKind::OpenShift {
            info!("tear down masters: skipping for cluster kind {}", self.config.kind);
            return Ok(());
        }
        if !force && self.masters.is_empty() {
            info!("tear down masters: skip without masters");
            return Ok(());
        }
        if !self.steps.contains(Phase::Masters) {
            info!("tear down masters: skip {} step", Phase::Masters);
            return Ok(());
        }
        info!("tear down masters: start tearing down masters on {}", cluster);

        let backend = self.services.backend.as_ref();
        let bridge = self.services.bridge.as_ref();

        backend.ensure_cluster_deleted(&cluster)?;
        for arch in [Arch::X86_64, Arch::Arm64] {
            backend.ensure_infraenv_deleted(&format!("{}-{}", cluster, arch))?;
        }

        bridge.update_dns(&cluster, None)?;
        bridge.remove_dhcp_entries(&self.masters)?;

        let groups = self.groups(&self.masters);
        fan_out(&groups, |g| g.teardown_nodes(NodeRole::Master))?;

        self.remove_image_pool()?;

        fan_out(&groups, |g| g.ensure_unlinked(bridge))?;

        for secret in [
            self.config.kubeconfig_path(),
            self.config.kubeadmin_password_path(),
        ] {
            match std::fs::remove_file(&secret) {
                Ok(()) => info!("Removed {}", secret.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(super) fn teardown_workers(&mut self, force: bool) -> Result<()> {
        let cluster = self.config.name.clone();
        if self.config.kind != ClusterKind::OpenShift {
            info!("tear down workers: skipping for cluster kind {}", self.config.kind);
            return Ok(());
        }
        if !force && self.masters.is_empty() {
            info!("tear down workers: skipping without masters");
            return Ok(());
        }
        // Workers go whenever masters go
        if !self.steps.contains(Phase::Workers) && !self.steps.contains(Phase::Masters) {
            info!(
                "tear down workers: skip {} and {} step",
                Phase::Workers,
                Phase::Masters
            );
            return Ok(());
        }
        info!("tear down workers: start tearing down (some) workers on {}", cluster);

        let bridge = self.services.bridge.as_ref();
        let groups = self.groups(&self.workers);
        fan_out(&groups, |g| g.teardown_nodes(NodeRole::Worker))?;
        bridge.remove_dhcp_entries(&self.workers)?;

        let master_hosts: HashSet<&str> = self.masters.iter().map(|n| n.host.as_str()).collect();
        for group in groups.iter().filter(|g| !master_hosts.contains(g.name())) {
            let remaining = if group.hosts_vms() {
                group.remaining_vms()?
            } else {
                Vec::new()
            };
            if remaining.is_empty() {
                group.ensure_unlinked(bridge)?;
            } else {
                debug!(
                    "bridge not unlinked as {:?} remaining on {}",
                    remaining,
                    group.name()
                );
            }
        }

        // Master teardown removes the whole cluster
        if self.steps.contains(Phase::Masters) {
            return Ok(());
        }

        for worker in &self.workers {
            info!("Deleting worker {}", worker.name);
            self.services.cluster_api.delete_node(&worker.name)?;
            self.services.backend.delete_host(&worker.name)?;
        }
        Ok(())
    }

    /// Drop the libvirt pool holding this cluster's local disk images
    fn remove_image_pool(&self) -> Result<()> {
        let local_vms = self
            .masters
            .iter()
            .chain(self.workers.iter())
            .any(|n| n.is_vm() && n.host == "localhost");
        if !local_vms {
            return Ok(());
        }

        let dir = image_dir(&self.config.name);
        let pool = dir
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sudo = RunOptions::new().sudo();
        // Both fail when the pool was never created
        self.local
            .run(&format!("virsh pool-destroy {}", quote(&pool)), &sudo)?;
        self.local
            .run(&format!("virsh pool-undefine {}", quote(&pool)), &sudo)?;
        Ok(())
    }
}
