//! Bridge, DHCP and DNS on libvirt's default network
//!
//! Booting nodes get their addresses from the dnsmasq that libvirt runs on
//! `virbr0`. Reservations are `ip-dhcp-host` entries of the `default`
//! network; stale leases live in dnsmasq's status file.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, info};

use crate::error::{CdaError, Result};
use crate::exec::{quote, Endpoint, RunOptions};
use crate::node::Node;
use crate::services::{BridgeNetwork, DhcpReservations};

const NETWORK: &str = "default";
const BRIDGE: &str = "virbr0";
const LEASES: &str = "/var/lib/libvirt/dnsmasq/virbr0.status";
const DNS_DIR: &str = "/etc/dnsmasq.d";

const NETWORK_ALREADY_ACTIVE: &str = "network is already active";

fn dhcp_host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<host\s[^>]*name=['"]([^'"]+)['"][^>]*/>"#)
            .unwrap_or_else(|e| unreachable!("static regex: {}", e))
    })
}

/// One lease in dnsmasq's status file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    #[serde(rename = "mac-address", default)]
    mac: String,
    #[serde(rename = "ip-address", default)]
    ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

pub struct VirshBridge {
    local: Arc<dyn Endpoint>,
    base_domain: String,
    /// `net-update` is not safe against concurrent writers
    updates: Mutex<()>,
}

impl VirshBridge {
    pub fn new(local: Arc<dyn Endpoint>, base_domain: &str) -> Self {
        Self {
            local,
            base_domain: base_domain.to_string(),
            updates: Mutex::new(()),
        }
    }

    fn sudo() -> RunOptions {
        RunOptions::new().sudo()
    }

    /// Every reservation line for `hostname` in the network definition
    fn reservations_for(&self, hostname: &str) -> Result<Vec<String>> {
        let xml = self
            .local
            .run_or_die(
                &format!("virsh net-dumpxml {}", NETWORK),
                &Self::sudo().quiet(),
            )?
            .out;
        Ok(dhcp_host_regex()
            .captures_iter(&xml)
            .filter(|c| &c[1] == hostname)
            .map(|c| c[0].to_string())
            .collect())
    }

    fn net_update(&self, op: &str, entry: &str) -> Result<()> {
        self.local.run_or_die(
            &format!(
                "virsh net-update {} {} ip-dhcp-host {} --live --config",
                NETWORK,
                op,
                quote(entry)
            ),
            &Self::sudo(),
        )?;
        Ok(())
    }

    fn drop_reservations(&self, hostname: &str) -> Result<()> {
        for entry in self.reservations_for(hostname)? {
            debug!("Removing DHCP reservation {}", entry);
            self.net_update("delete", &entry)?;
        }
        Ok(())
    }

    /// Forget leases handed to `macs` and restart the network
    fn clean_leases(&self, macs: &HashSet<String>) -> Result<()> {
        if self.local.exists(LEASES)? {
            let contents = self.local.read_file(LEASES)?;
            let leases: Vec<Lease> = if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&contents)?
            };
            let before = leases.len();
            let kept: Vec<Lease> = leases
                .into_iter()
                .filter(|l| !macs.contains(&l.mac.to_lowercase()))
                .collect();
            if kept.len() != before {
                info!("Dropping {} stale leases from {}", before - kept.len(), LEASES);
                self.local
                    .write_file(LEASES, &serde_json::to_string_pretty(&kept)?)?;
            }
        }
        self.local
            .run(&format!("virsh net-destroy {}", NETWORK), &Self::sudo())?;
        self.start_network(self.local.as_ref())
    }

    fn start_network(&self, host: &dyn Endpoint) -> Result<()> {
        let result = host.run(&format!("virsh net-start {}", NETWORK), &Self::sudo())?;
        if !result.success() && !result.err.contains(NETWORK_ALREADY_ACTIVE) {
            return Err(CdaError::Network(format!(
                "{}: could not start network {}: {}",
                host.hostname(),
                NETWORK,
                result.err.trim()
            )));
        }
        Ok(())
    }

    fn dns_file(cluster: &str) -> String {
        format!("{}/cda-{}.conf", DNS_DIR, cluster)
    }

    fn is_linked(host: &dyn Endpoint, port: &str) -> Result<bool> {
        let result = host.run(&format!("ip link show {}", quote(port)), &RunOptions::new().quiet())?;
        if !result.success() {
            return Err(CdaError::Network(format!(
                "{}: no interface {}",
                host.hostname(),
                port
            )));
        }
        Ok(result.out.contains(&format!("master {}", BRIDGE)))
    }

    fn link_port(host: &dyn Endpoint, port: &str) -> Result<()> {
        if Self::is_linked(host, port)? {
            debug!("{}: {} already on {}", host.hostname(), port, BRIDGE);
            return Ok(());
        }
        info!("{}: linking {} to {}", host.hostname(), port, BRIDGE);
        host.run_or_die(
            &format!("ip link set {} master {}", quote(port), BRIDGE),
            &Self::sudo(),
        )?;
        Ok(())
    }
}

impl BridgeNetwork for VirshBridge {
    fn configure(&self, host: &dyn Endpoint) -> Result<()> {
        self.start_network(host)?;
        host.run_or_die(&format!("virsh net-autostart {}", NETWORK), &Self::sudo())?;
        Ok(())
    }

    fn link(&self, host: &dyn Endpoint, api_port: Option<&str>) -> Result<()> {
        match api_port {
            Some(port) => Self::link_port(host, port),
            None => Ok(()),
        }
    }

    fn unlink(&self, host: &dyn Endpoint, api_port: Option<&str>) -> Result<()> {
        let port = match api_port {
            Some(port) => port,
            None => return Ok(()),
        };
        if !Self::is_linked(host, port)? {
            return Ok(());
        }
        info!("{}: unlinking {} from {}", host.hostname(), port, BRIDGE);
        host.run_or_die(&format!("ip link set {} nomaster", quote(port)), &Self::sudo())?;
        Ok(())
    }

    fn connect_external(&self, port: &str) -> Result<()> {
        Self::link_port(self.local.as_ref(), port)
    }

    fn remove_dhcp_entries(&self, nodes: &[Node]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let _guard = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        for node in nodes {
            self.drop_reservations(&node.name)?;
        }
        let macs = nodes.iter().map(|n| n.mac.to_lowercase()).collect();
        self.clean_leases(&macs)
    }

    fn update_dns(&self, cluster: &str, api_vip: Option<Ipv4Addr>) -> Result<()> {
        let path = Self::dns_file(cluster);
        match api_vip {
            Some(ip) => {
                let contents = format!(
                    "address=/api.{c}.{d}/{ip}\naddress=/api-int.{c}.{d}/{ip}\n",
                    c = cluster,
                    d = self.base_domain,
                    ip = ip
                );
                self.local
                    .run_or_die(&format!("mkdir -p {}", DNS_DIR), &Self::sudo())?;
                self.local.write_file(&path, &contents)?;
            }
            None => {
                self.local
                    .run_or_die(&format!("rm -f {}", quote(&path)), &Self::sudo())?;
            }
        }
        self.local
            .run("systemctl try-restart dnsmasq", &Self::sudo())?;
        Ok(())
    }
}

impl DhcpReservations for VirshBridge {
    fn upsert(&self, hostname: &str, mac: &str, ip: Ipv4Addr) -> Result<()> {
        let _guard = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_reservations(hostname)?;
        let entry = format!(r#"<host mac="{}" name="{}" ip="{}"/>"#, mac, hostname, ip);
        info!("Reserving {} for {} ({})", ip, hostname, mac);
        self.net_update("add", &entry)
    }
}
