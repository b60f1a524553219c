/*!
 * Configuration types for cda
 */

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CdaError, Result};
use crate::node::{Node, NodeKind, NodeRole};

/// Cluster flavour to deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    /// Full install driven by the install backend
    #[default]
    OpenShift,
    /// Single node booted straight from an install ISO
    Iso,
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterKind::OpenShift => write!(f, "openshift"),
            ClusterKind::Iso => write!(f, "iso"),
        }
    }
}

/// Top-level cluster description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    #[serde(default)]
    pub kind: ClusterKind,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_base_dns_domain")]
    pub base_dns_domain: String,

    #[serde(default)]
    pub api_vip: Option<Ipv4Addr>,

    #[serde(default)]
    pub ingress_vip: Option<Ipv4Addr>,

    #[serde(default = "default_ntp_source")]
    pub ntp_source: String,

    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub noproxy: Option<String>,

    #[serde(default = "default_pull_secret")]
    pub pull_secret: PathBuf,

    /// Where the cluster kubeconfig is stored (default: ./kubeconfig.<name>)
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Addresses handed out to cluster nodes by the bridge DHCP
    #[serde(default)]
    pub reserved_range: IpRange,

    /// Physical interface joined to the bridge after install
    #[serde(default)]
    pub external_port: Option<String>,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    #[serde(default)]
    pub masters: Vec<NodeConfig>,

    #[serde(default)]
    pub workers: Vec<NodeConfig>,

    #[serde(default)]
    pub preconfig: Vec<ExtraConfigStep>,

    #[serde(default)]
    pub postconfig: Vec<ExtraConfigStep>,

    /// Install ISO for the `iso` cluster kind
    #[serde(default)]
    pub install_iso: Option<String>,

    /// Local directory boot images are downloaded to
    #[serde(default = "default_iso_dir")]
    pub iso_dir: PathBuf,

    /// Directory on an accelerator's host that its boot image is copied to
    #[serde(default = "default_accelerator_iso_dir")]
    pub accelerator_iso_dir: PathBuf,

    /// URL physical nodes fetch boot images from (default: served from iso_dir)
    #[serde(default)]
    pub iso_base_url: Option<String>,

    #[serde(default = "default_node_root_password")]
    pub node_root_password: String,

    #[serde(default = "default_node_username")]
    pub node_username: String,

    /// Minimum processing units required on the local host
    #[serde(default = "default_min_local_cores")]
    pub min_local_cores: u32,

    /// Fall back to agent/auto-discovered keys after explicit logins
    #[serde(default = "default_true")]
    pub discover_auth: bool,

    /// Install backend endpoint passed to the backend client
    #[serde(default)]
    pub backend_url: Option<String>,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Fixed interval constants used across the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Sleep between failed connect attempts
    #[serde(default = "default_connect_backoff_secs")]
    pub connect_backoff_secs: u64,

    /// Give up connecting after this long
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_known_state_poll_secs")]
    pub known_state_poll_secs: u64,

    #[serde(default = "default_correlation_poll_secs")]
    pub correlation_poll_secs: u64,

    /// Passes before correlation gives up (None = retry forever)
    #[serde(default)]
    pub correlation_max_attempts: Option<u64>,

    #[serde(default = "default_worker_ready_poll_secs")]
    pub worker_ready_poll_secs: u64,

    #[serde(default = "default_boot_poll_secs")]
    pub boot_poll_secs: u64,

    /// Sleep between non-blocking stream reads while capturing output
    #[serde(default = "default_capture_poll_ms")]
    pub capture_poll_ms: u64,

    #[serde(default = "default_boot_retries")]
    pub boot_retries: u32,

    #[serde(default = "default_boot_retry_delay_secs")]
    pub boot_retry_delay_secs: u64,

    /// Silent boot polls before a physical node is power cycled (None = never)
    #[serde(default = "default_cold_boot_after_polls")]
    pub cold_boot_after_polls: Option<u64>,

    #[serde(default = "default_cold_boot_cycles")]
    pub cold_boot_cycles: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_backoff_secs: default_connect_backoff_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            known_state_poll_secs: default_known_state_poll_secs(),
            correlation_poll_secs: default_correlation_poll_secs(),
            correlation_max_attempts: None,
            worker_ready_poll_secs: default_worker_ready_poll_secs(),
            boot_poll_secs: default_boot_poll_secs(),
            capture_poll_ms: default_capture_poll_ms(),
            boot_retries: default_boot_retries(),
            boot_retry_delay_secs: default_boot_retry_delay_secs(),
            cold_boot_after_polls: default_cold_boot_after_polls(),
            cold_boot_cycles: default_cold_boot_cycles(),
        }
    }
}

impl TimingConfig {
    /// Every interval zero; connect timeout kept short
    pub fn immediate() -> Self {
        Self {
            connect_backoff_secs: 0,
            connect_timeout_secs: 5,
            known_state_poll_secs: 0,
            correlation_poll_secs: 0,
            correlation_max_attempts: None,
            worker_ready_poll_secs: 0,
            boot_poll_secs: 0,
            capture_poll_ms: 0,
            boot_retries: 2,
            boot_retry_delay_secs: 0,
            cold_boot_after_polls: Some(3),
            cold_boot_cycles: 2,
        }
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn known_state_poll(&self) -> Duration {
        Duration::from_secs(self.known_state_poll_secs)
    }

    pub fn correlation_poll(&self) -> Duration {
        Duration::from_secs(self.correlation_poll_secs)
    }

    pub fn worker_ready_poll(&self) -> Duration {
        Duration::from_secs(self.worker_ready_poll_secs)
    }

    pub fn boot_poll(&self) -> Duration {
        Duration::from_secs(self.boot_poll_secs)
    }

    pub fn capture_poll(&self) -> Duration {
        Duration::from_millis(self.capture_poll_ms)
    }

    pub fn boot_retry_delay(&self) -> Duration {
        Duration::from_secs(self.boot_retry_delay_secs)
    }
}

/// A machine that hosts cluster nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,

    #[serde(default = "default_host_username")]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Interface linked to the cluster bridge
    #[serde(default)]
    pub network_api_port: Option<String>,

    /// Host is already provisioned and only carries nodes
    #[serde(default = "default_true")]
    pub pre_installed: bool,
}

/// One cluster node as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    #[serde(default = "default_node_kind")]
    pub kind: NodeKind,

    #[serde(default = "default_node_host", alias = "node")]
    pub host: String,

    pub mac: String,

    #[serde(default)]
    pub ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub bmc: Option<BmcConfig>,

    #[serde(default = "default_ram_mb")]
    pub ram_mb: u32,

    #[serde(default = "default_cpus")]
    pub cpus: u32,

    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
}

/// Remote-management controller credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmcConfig {
    pub address: String,

    #[serde(default = "default_bmc_user")]
    pub user: String,

    #[serde(default = "default_bmc_password", serialize_with = "redacted")]
    pub password: SecretString,
}

impl PartialEq for BmcConfig {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.user == other.user
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for BmcConfig {}

fn redacted<S: Serializer>(_secret: &SecretString, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str("***")
}

/// Inclusive IPv4 range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Default for IpRange {
    fn default() -> Self {
        Self {
            start: Ipv4Addr::new(192, 168, 122, 1),
            end: Ipv4Addr::new(192, 168, 122, 254),
        }
    }
}

impl IpRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        u32::from(self.start) <= ip && ip <= u32::from(self.end)
    }
}

/// A named pre/post configuration step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraConfigStep {
    pub name: String,
    pub script: PathBuf,
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// A selectable deployment step
///
/// Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Pre,
    Masters,
    Workers,
    Post,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Pre, Phase::Masters, Phase::Workers, Phase::Post];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => write!(f, "pre"),
            Phase::Masters => write!(f, "masters"),
            Phase::Workers => write!(f, "workers"),
            Phase::Post => write!(f, "post"),
        }
    }
}

impl FromStr for Phase {
    type Err = CdaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pre" => Ok(Phase::Pre),
            "masters" => Ok(Phase::Masters),
            "workers" => Ok(Phase::Workers),
            "post" => Ok(Phase::Post),
            other => Err(CdaError::Config(format!(
                "unknown step '{}' (expected pre, masters, workers or post)",
                other
            ))),
        }
    }
}

/// Caller-selected subset of phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSet(BTreeSet<Phase>);

impl StepSet {
    pub fn all() -> Self {
        Self(Phase::ALL.into_iter().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn only(phases: &[Phase]) -> Self {
        Self(phases.iter().copied().collect())
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0.contains(&phase)
    }

    /// Selected phases in execution order
    pub fn iter(&self) -> impl Iterator<Item = Phase> + '_ {
        self.0.iter().copied()
    }
}

impl Default for StepSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for StepSet {
    type Err = CdaError;

    /// Parse a comma separated list such as `pre,masters`
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Phase::from_str)
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }
}

impl fmt::Display for StepSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| CdaError::Config(e.to_string()))
    }

    /// Structural checks that need no host access
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CdaError::Config("cluster name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for node in self.masters.iter().chain(self.workers.iter()) {
            if !seen.insert(node.name.as_str()) {
                return Err(CdaError::Config(format!(
                    "node name '{}' is used more than once",
                    node.name
                )));
            }
            if node.host != "localhost" && self.host_config(&node.host).is_none() {
                return Err(CdaError::Config(format!(
                    "node '{}' references unknown host '{}'",
                    node.name, node.host
                )));
            }
            if node.kind == NodeKind::Physical && node.bmc.is_none() {
                return Err(CdaError::Config(format!(
                    "physical node '{}' has no bmc section",
                    node.name
                )));
            }
        }

        if self.kind == ClusterKind::OpenShift
            && self.masters.len() > 1
            && (self.api_vip.is_none() || self.ingress_vip.is_none())
        {
            return Err(CdaError::Config(
                "api_vip and ingress_vip are required with more than one master".to_string(),
            ));
        }

        if self.kind == ClusterKind::Iso && self.masters.len() != 1 {
            return Err(CdaError::Config(
                "iso clusters need exactly one master".to_string(),
            ));
        }

        Ok(())
    }

    pub fn master_nodes(&self) -> Vec<Node> {
        self.masters
            .iter()
            .map(|c| Node::from_config(&self.name, NodeRole::Master, c))
            .collect()
    }

    pub fn worker_nodes(&self) -> Vec<Node> {
        self.workers
            .iter()
            .map(|c| Node::from_config(&self.name, NodeRole::Worker, c))
            .collect()
    }

    pub fn is_sno(&self) -> bool {
        self.masters.len() == 1
    }

    pub fn has_accelerator_workers(&self) -> bool {
        self.workers.iter().any(|w| w.kind == NodeKind::Accelerator)
    }

    pub fn host_config(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.kubeconfig
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("./kubeconfig.{}", self.name)))
    }

    /// `kubeadmin-password.<name>` next to the kubeconfig
    pub fn kubeadmin_password_path(&self) -> PathBuf {
        let file = format!("kubeadmin-password.{}", self.name);
        match self.kubeconfig_path().parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(file),
            _ => PathBuf::from(file),
        }
    }

    /// Host names carrying masters, workers or both, in first-seen order
    pub fn node_hosts(&self, nodes: &[NodeConfig]) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for node in nodes {
            if !hosts.contains(&node.host) {
                hosts.push(node.host.clone());
            }
        }
        hosts
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "4.14.0-nightly".to_string()
}

fn default_base_dns_domain() -> String {
    "redhat.com".to_string()
}

fn default_ntp_source() -> String {
    "clock.redhat.com".to_string()
}

fn default_pull_secret() -> PathBuf {
    PathBuf::from("pull_secret.json")
}

fn default_iso_dir() -> PathBuf {
    PathBuf::from("/root/iso")
}

fn default_accelerator_iso_dir() -> PathBuf {
    PathBuf::from("/root/iso")
}

fn default_node_root_password() -> String {
    "redhat".to_string()
}

fn default_node_username() -> String {
    "core".to_string()
}

fn default_host_username() -> String {
    "core".to_string()
}

fn default_min_local_cores() -> u32 {
    28
}

fn default_node_kind() -> NodeKind {
    NodeKind::Vm
}

fn default_node_host() -> String {
    "localhost".to_string()
}

fn default_ram_mb() -> u32 {
    32768
}

fn default_cpus() -> u32 {
    8
}

fn default_disk_gb() -> u32 {
    48
}

fn default_bmc_user() -> String {
    "root".to_string()
}

fn default_bmc_password() -> SecretString {
    SecretString::from("calvin")
}

fn default_connect_backoff_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    3600
}

fn default_known_state_poll_secs() -> u64 {
    5
}

fn default_correlation_poll_secs() -> u64 {
    5
}

fn default_worker_ready_poll_secs() -> u64 {
    30
}

fn default_boot_poll_secs() -> u64 {
    5
}

fn default_capture_poll_ms() -> u64 {
    1
}

fn default_boot_retries() -> u32 {
    10
}

fn default_boot_retry_delay_secs() -> u64 {
    60
}

fn default_cold_boot_after_polls() -> Option<u64> {
    Some(120)
}

fn default_cold_boot_cycles() -> u32 {
    3
}
