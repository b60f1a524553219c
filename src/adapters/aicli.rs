//! Install backend driven through the `aicli` command
//!
//! Listings are requested as JSON and parsed with serde. Interface addresses
//! come from each host's inventory document, itself a JSON string.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use cda_core_resilience::{Poll, PollConfig, PollError, PollLoop};

use crate::config::{ClusterConfig, TimingConfig};
use crate::error::{CdaError, Result};
use crate::exec::{quote, Endpoint, ExecutionResult, RunOptions};
use crate::node::Arch;
use crate::services::{InstallBackend, InventoryHost};

const DEFAULT_URL: &str = "0.0.0.0:8090";
const DOWNLOAD_ATTEMPTS: u64 = 10;
const START_ATTEMPTS: u64 = 60;

#[derive(Debug, Deserialize)]
struct Named {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    id: String,
    #[serde(alias = "requested_hostname")]
    name: String,
    #[serde(default)]
    infra_env_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    /// JSON document as a string
    #[serde(default)]
    inventory: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Inventory {
    #[serde(default)]
    interfaces: Vec<Interface>,
}

#[derive(Debug, Deserialize)]
struct Interface {
    #[serde(default)]
    ipv4_addresses: Vec<String>,
    #[serde(default)]
    mac_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    api_vips: Vec<Vip>,
}

#[derive(Debug, Deserialize)]
struct Vip {
    ip: Ipv4Addr,
}

impl RawHost {
    fn into_inventory_host(self) -> Result<InventoryHost> {
        let inventory: Inventory = match &self.inventory {
            Some(doc) => serde_json::from_str(doc)?,
            None => Inventory::default(),
        };
        let ipv4_addresses = inventory
            .interfaces
            .iter()
            .flat_map(|nic| nic.ipv4_addresses.iter())
            .filter_map(|cidr| cidr.split('/').next()?.parse().ok())
            .collect();
        let mac_addresses = inventory
            .interfaces
            .into_iter()
            .filter_map(|nic| nic.mac_address)
            .collect();
        Ok(InventoryHost {
            id: self.id,
            name: self.name,
            infra_env_id: self.infra_env_id,
            status: self.status,
            ipv4_addresses,
            mac_addresses,
        })
    }
}

pub struct AicliBackend {
    local: Arc<dyn Endpoint>,
    url: String,
    retry_delay: Duration,
}

impl AicliBackend {
    pub fn new(local: Arc<dyn Endpoint>, url: Option<&str>, timing: &TimingConfig) -> Self {
        Self {
            local,
            url: url.unwrap_or(DEFAULT_URL).to_string(),
            retry_delay: timing.known_state_poll(),
        }
    }

    fn command(&self, args: &str) -> String {
        format!("aicli -U {} {}", quote(&self.url), args)
    }

    fn run(&self, args: &str) -> Result<ExecutionResult> {
        self.local.run(&self.command(args), &RunOptions::new())
    }

    fn run_or_die(&self, args: &str) -> Result<ExecutionResult> {
        let cmd = self.command(args);
        let result = self.local.run(&cmd, &RunOptions::new())?;
        if !result.success() {
            return Err(CdaError::Backend(format!(
                "{} failed (rc={}): {}",
                cmd,
                result.returncode,
                result.err.trim()
            )));
        }
        Ok(result)
    }

    fn json<T: DeserializeOwned>(&self, args: &str) -> Result<T> {
        let result = self.local.run(
            &self.command(&format!("-o json {}", args)),
            &RunOptions::new().quiet(),
        )?;
        if !result.success() {
            return Err(CdaError::Backend(format!(
                "aicli {} failed: {}",
                args,
                result.err.trim()
            )));
        }
        Ok(serde_json::from_str(&result.out)?)
    }

    fn find(&self, kind: &str, name: &str) -> Result<Option<Named>> {
        let items: Vec<Named> = self.json(&format!("list {}", kind))?;
        Ok(items.into_iter().find(|c| c.name == name))
    }

    /// `aicli download <what>` names its output `<what>.<cluster>`; move it to `dest`
    fn download_cluster_file(&self, what: &str, cluster: &str, dest: &Path) -> Result<()> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        self.run_or_die(&format!(
            "download {} {} -p {}",
            what,
            quote(cluster),
            quote(&dir.display().to_string())
        ))?;
        let downloaded = dir.join(format!("{}.{}", what, cluster));
        if downloaded != dest {
            std::fs::rename(&downloaded, dest)?;
        }
        Ok(())
    }

    /// Retry `args` until it succeeds, up to `attempts` times
    fn retry(&self, args: &str, attempts: u64) -> Result<()> {
        let poll = PollConfig::every(self.retry_delay).with_max_attempts(Some(attempts));
        let result = PollLoop::new(poll).run(|attempt| -> Result<Poll<()>> {
            let result = self.run(args)?;
            if result.success() {
                return Ok(Poll::Ready(()));
            }
            debug!("aicli {} attempt {} failed: {}", args, attempt, result.err.trim());
            Ok(Poll::Pending)
        });
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Aborted(e)) => Err(e),
            Err(e) => Err(CdaError::Backend(format!("aicli {}: {}", args, e))),
        }
    }

    fn params(pairs: &[(&str, String)]) -> String {
        pairs
            .iter()
            .map(|(k, v)| format!("-P {}", quote(&format!("{}={}", k, v))))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn common_params(config: &ClusterConfig) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("openshift_version", config.version.clone()),
            ("pull_secret", config.pull_secret.display().to_string()),
        ];
        if let Some(proxy) = &config.proxy {
            params.push(("proxy", proxy.clone()));
        }
        if let Some(noproxy) = &config.noproxy {
            params.push(("noproxy", noproxy.clone()));
        }
        params
    }
}

impl InstallBackend for AicliBackend {
    fn create_cluster(&self, config: &ClusterConfig) -> Result<()> {
        if self.find("clusters", &config.name)?.is_some() {
            info!("Cluster {} already exists", config.name);
            return Ok(());
        }

        let mut params = Self::common_params(config);
        params.extend([
            ("cpu_architecture", "multi".to_string()),
            ("infraenv", "false".to_string()),
            ("vip_dhcp_allocation", "false".to_string()),
            ("additional_ntp_source", config.ntp_source.clone()),
            ("base_dns_domain", config.base_dns_domain.clone()),
            ("sno", config.is_sno().to_string()),
        ]);
        if !config.is_sno() {
            if let (Some(api), Some(ingress)) = (config.api_vip, config.ingress_vip) {
                params.push(("api_vips", format!("[{{\"ip\": \"{}\"}}]", api)));
                params.push(("ingress_vips", format!("[{{\"ip\": \"{}\"}}]", ingress)));
            }
        }

        info!("Creating cluster {}", config.name);
        self.run_or_die(&format!(
            "create cluster {} {}",
            quote(&config.name),
            Self::params(&params)
        ))?;
        Ok(())
    }

    fn ensure_cluster_deleted(&self, cluster: &str) -> Result<()> {
        if self.find("clusters", cluster)?.is_none() {
            debug!("Cluster {} does not exist", cluster);
            return Ok(());
        }
        info!("Deleting cluster {}", cluster);
        self.run_or_die(&format!("delete cluster {} -y", quote(cluster)))?;
        Ok(())
    }

    fn ensure_infraenv_created(
        &self,
        infra_env: &str,
        config: &ClusterConfig,
        arch: Arch,
    ) -> Result<()> {
        if self.find("infraenvs", infra_env)?.is_some() {
            debug!("Infraenv {} already exists", infra_env);
            return Ok(());
        }
        let mut params = Self::common_params(config);
        params.push(("cluster", config.name.clone()));
        params.push(("cpu_architecture", arch.to_string()));
        self.run_or_die(&format!(
            "create infraenv {} {}",
            quote(infra_env),
            Self::params(&params)
        ))?;
        Ok(())
    }

    fn ensure_infraenv_deleted(&self, infra_env: &str) -> Result<()> {
        if self.find("infraenvs", infra_env)?.is_none() {
            return Ok(());
        }
        info!("Deleting infraenv {}", infra_env);
        self.run_or_die(&format!("delete infraenv {} -y", quote(infra_env)))?;
        Ok(())
    }

    fn infra_env_id(&self, infra_env: &str) -> Result<Option<String>> {
        Ok(self.find("infraenvs", infra_env)?.map(|e| e.id))
    }

    fn download_iso(&self, infra_env: &str, dir: &Path) -> Result<PathBuf> {
        let dir_str = dir.display().to_string();
        self.local
            .run_or_die(&format!("mkdir -p {}", quote(&dir_str)), &RunOptions::new())?;
        info!("Downloading iso for {} to {}", infra_env, dir_str);
        self.retry(
            &format!("download iso {} -p {}", quote(infra_env), quote(&dir_str)),
            DOWNLOAD_ATTEMPTS,
        )?;
        Ok(dir.join(format!("{}.iso", infra_env)))
    }

    fn start_until_success(&self, cluster: &str) -> Result<()> {
        self.retry(&format!("start cluster {}", quote(cluster)), START_ATTEMPTS)
    }

    fn wait_cluster(&self, cluster: &str) -> Result<()> {
        info!("Waiting for cluster {} to finish installing", cluster);
        self.run_or_die(&format!("wait {}", quote(cluster)))?;
        Ok(())
    }

    fn host_status(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .list_hosts()?
            .into_iter()
            .find(|h| h.name == name)
            .and_then(|h| h.status))
    }

    fn list_hosts(&self) -> Result<Vec<InventoryHost>> {
        let hosts: Vec<RawHost> = self.json("list hosts")?;
        hosts.into_iter().map(RawHost::into_inventory_host).collect()
    }

    fn update_host_name(&self, host_id: &str, name: &str) -> Result<()> {
        self.run_or_die(&format!(
            "update host {} {}",
            quote(host_id),
            Self::params(&[("name", name.to_string())])
        ))?;
        Ok(())
    }

    fn delete_host(&self, name: &str) -> Result<()> {
        let result = self.run(&format!("delete host {}", quote(name)))?;
        if !result.success() {
            debug!("host {} not deleted: {}", name, result.err.trim());
        }
        Ok(())
    }

    fn download_kubeconfig(&self, cluster: &str, dest: &Path) -> Result<()> {
        self.download_cluster_file("kubeconfig", cluster, dest)
    }

    fn download_kubeadmin_password(&self, cluster: &str, dest: &Path) -> Result<()> {
        self.download_cluster_file("kubeadmin-password", cluster, dest)
    }

    fn download_discovery_ignition(&self, infra_env: &str, dir: &Path) -> Result<PathBuf> {
        self.run_or_die(&format!(
            "download discovery-ignition {} -p {}",
            quote(infra_env),
            quote(&dir.display().to_string())
        ))?;
        Ok(dir.join(format!("discovery.ign.{}", infra_env)))
    }

    fn allow_add_workers(&self, cluster: &str) -> Result<()> {
        self.run_or_die(&format!("update cluster {} -P day2=true", quote(cluster)))?;
        Ok(())
    }

    fn start_infraenv(&self, infra_env: &str) -> Result<()> {
        self.run_or_die(&format!("start infraenv {}", quote(infra_env)))?;
        Ok(())
    }

    fn api_vip(&self, cluster: &str) -> Result<Option<Ipv4Addr>> {
        if self.find("clusters", cluster)?.is_none() {
            return Ok(None);
        }
        let info: ClusterInfo = self.json(&format!("info cluster {}", quote(cluster)))?;
        Ok(info.api_vips.first().map(|v| v.ip))
    }
}
