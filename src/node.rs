/*!
 * Cluster node model
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::{BmcConfig, NodeConfig};

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// How a node comes into existence and boots
///
/// Each variant has exactly one boot strategy (see [`crate::boot`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Libvirt guest created on its hosting machine
    Vm,
    /// Bare-metal server booted through its BMC
    Physical,
    /// Network-accelerator card acting as a cluster node
    #[serde(alias = "bf", alias = "dpu", alias = "ipu")]
    Accelerator,
}

impl NodeKind {
    /// CPU architecture of the boot media this kind needs
    pub fn arch(&self) -> Arch {
        match self {
            NodeKind::Vm | NodeKind::Physical => Arch::X86_64,
            NodeKind::Accelerator => Arch::Arm64,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Vm => write!(f, "vm"),
            NodeKind::Physical => write!(f, "physical"),
            NodeKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Boot-media architecture; names an infra-env
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

/// A logical cluster member
///
/// Built from configuration before any phase runs. Only `observed_ip` changes
/// during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub kind: NodeKind,
    /// Name of the hosting machine
    pub host: String,
    pub mac: String,
    /// Address reserved for the node in DHCP
    pub ip: Option<Ipv4Addr>,
    /// Address the node was actually seen on after boot
    pub observed_ip: Option<Ipv4Addr>,
    pub bmc: Option<BmcConfig>,
    pub ram_mb: u32,
    pub cpus: u32,
    pub disk_gb: u32,
    pub image_path: PathBuf,
}

impl Node {
    pub fn from_config(cluster_name: &str, role: NodeRole, config: &NodeConfig) -> Self {
        let image_path = image_dir(cluster_name).join(format!("{}.qcow2", config.name));
        Self {
            name: config.name.clone(),
            role,
            kind: config.kind,
            host: config.host.clone(),
            mac: config.mac.clone(),
            ip: config.ip,
            observed_ip: None,
            bmc: config.bmc.clone(),
            ram_mb: config.ram_mb,
            cpus: config.cpus,
            disk_gb: config.disk_gb,
            image_path,
        }
    }

    /// Address to reach the node at: observed if known, reserved otherwise
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.observed_ip.or(self.ip)
    }

    pub fn is_vm(&self) -> bool {
        self.kind == NodeKind::Vm
    }
}

/// Directory holding a cluster's VM disk images
pub fn image_dir(cluster_name: &str) -> PathBuf {
    PathBuf::from(format!("/home/{}_guests_images", cluster_name))
}
