/*!
 * External collaborators consumed by the orchestrator
 *
 * The install backend, the cluster API, DHCP, remote-management boot, the
 * bridge network and the extra-config runner are all reached through these
 * traits. Concrete command-line adapters live in [`crate::adapters`]; tests
 * use the mocks in the `testing` module.
 */

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{BmcConfig, ClusterConfig, ExtraConfigStep};
use crate::error::Result;
use crate::exec::Endpoint;
use crate::node::{Arch, Node};

/// One host record in the backend inventory
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InventoryHost {
    pub id: String,
    pub name: String,
    pub infra_env_id: Option<String>,
    pub status: Option<String>,
    /// Interface addresses with the prefix length stripped
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub mac_addresses: Vec<String>,
}

impl InventoryHost {
    pub fn has_mac(&self, mac: &str) -> bool {
        self.mac_addresses.iter().any(|m| m.eq_ignore_ascii_case(mac))
    }
}

/// Cluster-install backend
pub trait InstallBackend: Send + Sync {
    /// Create the cluster record unless it exists
    fn create_cluster(&self, config: &ClusterConfig) -> Result<()>;

    fn ensure_cluster_deleted(&self, cluster: &str) -> Result<()>;

    fn ensure_infraenv_created(&self, infra_env: &str, config: &ClusterConfig, arch: Arch)
        -> Result<()>;

    fn ensure_infraenv_deleted(&self, infra_env: &str) -> Result<()>;

    fn infra_env_id(&self, infra_env: &str) -> Result<Option<String>>;

    /// Download the infra-env's discovery image into `dir`, returning its path
    fn download_iso(&self, infra_env: &str, dir: &Path) -> Result<PathBuf>;

    /// Kick off the install, retrying until the backend accepts it
    fn start_until_success(&self, cluster: &str) -> Result<()>;

    /// Block until the cluster finished installing
    fn wait_cluster(&self, cluster: &str) -> Result<()>;

    /// Status of the named host; `None` while the backend has not seen it
    fn host_status(&self, name: &str) -> Result<Option<String>>;

    fn list_hosts(&self) -> Result<Vec<InventoryHost>>;

    fn update_host_name(&self, host_id: &str, name: &str) -> Result<()>;

    fn delete_host(&self, name: &str) -> Result<()>;

    fn download_kubeconfig(&self, cluster: &str, dest: &Path) -> Result<()>;

    /// Save the cluster's `kubeadmin` password to `dest`
    fn download_kubeadmin_password(&self, cluster: &str, dest: &Path) -> Result<()>;

    /// Download the ignition config the discovery image boots with into `dir`
    fn download_discovery_ignition(&self, infra_env: &str, dir: &Path) -> Result<PathBuf>;

    fn allow_add_workers(&self, cluster: &str) -> Result<()>;

    /// Install the hosts of an infra-env added to a running cluster
    fn start_infraenv(&self, infra_env: &str) -> Result<()>;

    fn api_vip(&self, cluster: &str) -> Result<Option<Ipv4Addr>>;
}

/// Kubernetes API of the installed cluster
pub trait ClusterApi: Send + Sync {
    fn is_ready(&self, node: &str) -> Result<bool>;

    /// Approve every pending certificate signing request, returning how many
    fn approve_pending_csrs(&self) -> Result<usize>;

    fn delete_node(&self, node: &str) -> Result<()>;
}

/// Fixed DHCP reservations
///
/// Implementations serialize concurrent writers themselves; the same
/// hostname always replaces its previous reservation.
pub trait DhcpReservations: Send + Sync {
    fn upsert(&self, hostname: &str, mac: &str, ip: Ipv4Addr) -> Result<()>;
}

/// Out-of-band control through a remote-management controller
pub trait BootController: Send + Sync {
    /// Boot once from the image at `iso_url`, retrying a bounded number of times
    fn boot_iso(&self, bmc: &BmcConfig, iso_url: &str) -> Result<()>;

    /// Force the server off, then on again
    fn power_cycle(&self, bmc: &BmcConfig) -> Result<()>;
}

/// Local bridge that gives booting nodes DHCP and DNS
pub trait BridgeNetwork: Send + Sync {
    /// Make sure the bridge exists and is configured on `host`
    fn configure(&self, host: &dyn Endpoint) -> Result<()>;

    /// Attach the host's API port to the bridge
    fn link(&self, host: &dyn Endpoint, api_port: Option<&str>) -> Result<()>;

    fn unlink(&self, host: &dyn Endpoint, api_port: Option<&str>) -> Result<()>;

    /// Attach the physical external port to the local bridge
    fn connect_external(&self, port: &str) -> Result<()>;

    fn remove_dhcp_entries(&self, nodes: &[Node]) -> Result<()>;

    /// Point the cluster's DNS names at `api_vip`; `None` removes them
    fn update_dns(&self, cluster: &str, api_vip: Option<Ipv4Addr>) -> Result<()>;
}

/// Runs pre/post configuration steps
pub trait ExtraConfigRunner: Send + Sync {
    fn run(&self, step: &ExtraConfigStep) -> Result<()>;
}

/// Every collaborator the orchestrator talks to
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn InstallBackend>,
    pub cluster_api: Arc<dyn ClusterApi>,
    pub dhcp: Arc<dyn DhcpReservations>,
    pub boot: Arc<dyn BootController>,
    pub bridge: Arc<dyn BridgeNetwork>,
    pub extra: Arc<dyn ExtraConfigRunner>,
}
