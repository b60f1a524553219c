/*!
 * Boot strategies, one per node kind
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::error::{CdaError, Result};
use crate::exec::{quote, Endpoint, RunOptions};
use crate::node::{image_dir, Node, NodeKind};
use crate::services::Services;

/// Boot image of an infra-env, as a local file and as a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMedia {
    pub path: PathBuf,
    pub url: String,
}

impl BootMedia {
    /// `base_url` is where remote-management controllers fetch the file from
    pub fn new(path: PathBuf, base_url: Option<&str>) -> Self {
        let file = file_name(&path);
        let url = match base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), file),
            None => format!("file://{}", path.display()),
        };
        Self { path, url }
    }

    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// What a strategy needs besides the node and its hosting endpoint
#[derive(Clone)]
pub struct BootEnv {
    pub services: Services,
    pub cluster: Arc<ClusterConfig>,
    pub media: BootMedia,
    /// Private key handed to accelerator pxeboot
    pub ssh_key: Option<PathBuf>,
}

pub trait BootStrategy: Send + Sync {
    /// Create or power on the node so it boots from `env.media`
    fn start(&self, node: &Node, host: &dyn Endpoint, env: &BootEnv) -> Result<()>;

    /// Remove whatever `start` left on the host
    fn teardown(&self, node: &Node, host: &dyn Endpoint) -> Result<()>;

    /// Console or installer logs, when the kind keeps any
    fn logs(&self, node: &Node, host: &dyn Endpoint) -> Result<Option<String>>;
}

/// Strategy for a node kind
pub fn strategy_for(kind: NodeKind) -> &'static dyn BootStrategy {
    match kind {
        NodeKind::Vm => &VmBoot,
        NodeKind::Physical => &BmcBoot,
        NodeKind::Accelerator => &AcceleratorBoot,
    }
}

/// Libvirt guest on the hosting machine
pub struct VmBoot;

impl BootStrategy for VmBoot {
    fn start(&self, node: &Node, host: &dyn Endpoint, env: &BootEnv) -> Result<()> {
        let sudo = RunOptions::new().sudo();
        let dir = image_dir(&env.cluster.name);
        let dir = dir.to_string_lossy();
        host.run_or_die(&format!("mkdir -p {}", quote(&dir)), &sudo)?;

        let iso = format!("{}/{}", dir, env.media.file_name());
        host.copy_to(&env.media.path, &iso)?;

        let image = node.image_path.to_string_lossy();
        info!("{}: creating {}G disk {} for {}", host.hostname(), node.disk_gb, image, node.name);
        host.run_or_die(
            &format!("qemu-img create -f qcow2 {} {}G", quote(&image), node.disk_gb),
            &sudo,
        )?;

        let cmd = format!(
            "virt-install --connect qemu:///system -n {name} -r {ram} --cpu host --vcpus {cpus} \
             --os-variant=rhel8.6 --import --network bridge=virbr0,mac={mac} \
             --events on_reboot=restart --cdrom {iso} --disk path={image} --noautoconsole",
            name = quote(&node.name),
            ram = node.ram_mb,
            cpus = node.cpus,
            mac = quote(&node.mac),
            iso = quote(&iso),
            image = quote(&image),
        );
        host.run_or_die(&cmd, &sudo)?;
        Ok(())
    }

    fn teardown(&self, node: &Node, host: &dyn Endpoint) -> Result<()> {
        let sudo = RunOptions::new().sudo();
        let name = quote(&node.name);
        // Either may fail when the domain is already gone
        host.run(&format!("virsh destroy {}", name), &sudo)?;
        host.run(&format!("virsh undefine --nvram {}", name), &sudo)?;
        host.run_or_die(
            &format!("rm -f {}", quote(&node.image_path.to_string_lossy())),
            &sudo,
        )?;
        Ok(())
    }

    fn logs(&self, node: &Node, host: &dyn Endpoint) -> Result<Option<String>> {
        let path = format!("/var/log/libvirt/qemu/{}.log", node.name);
        let result = host.run(&format!("cat {}", quote(&path)), &RunOptions::new().sudo().quiet())?;
        Ok(result.success().then_some(result.out))
    }
}

/// Bare-metal server booted through its BMC
pub struct BmcBoot;

impl BootStrategy for BmcBoot {
    fn start(&self, node: &Node, _host: &dyn Endpoint, env: &BootEnv) -> Result<()> {
        let bmc = node
            .bmc
            .as_ref()
            .ok_or_else(|| CdaError::Config(format!("{} has no bmc section", node.name)))?;
        info!("{}: booting {} through {}", node.name, env.media.url, bmc.address);
        env.services.boot.boot_iso(bmc, &env.media.url)
    }

    fn teardown(&self, node: &Node, _host: &dyn Endpoint) -> Result<()> {
        debug!("{}: nothing to remove for a physical node", node.name);
        Ok(())
    }

    fn logs(&self, _node: &Node, _host: &dyn Endpoint) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Network-accelerator card pxebooted from a helper container on its host
pub struct AcceleratorBoot;

const PXEBOOT_IMAGE: &str = "quay.io/bnemeth/bf";

impl AcceleratorBoot {
    fn container(node: &Node) -> String {
        format!("{}-pxeboot", node.name)
    }
}

impl BootStrategy for AcceleratorBoot {
    fn start(&self, node: &Node, host: &dyn Endpoint, env: &BootEnv) -> Result<()> {
        let sudo = RunOptions::new().sudo();
        let dir = env.cluster.accelerator_iso_dir.to_string_lossy().into_owned();
        host.run_or_die(&format!("mkdir -p {}", quote(&dir)), &sudo)?;

        let iso = format!("{}/{}", dir, env.media.file_name());
        host.copy_to(&env.media.path, &iso)?;

        let key = format!("{}/ssh_priv_key", dir);
        if let Some(local_key) = &env.ssh_key {
            host.copy_to(local_key, &key)?;
        }

        // A previous pxeboot server may still hold the ports
        host.run("killall python3", &sudo)?;

        let container = Self::container(node);
        host.run_or_die(
            &format!(
                "podman run --pull always --replace --pid host --network host --user 0 \
                 --name {name} -dit --privileged -v /dev:/dev -v {dir}:{dir} {image}",
                name = quote(&container),
                dir = quote(&dir),
                image = PXEBOOT_IMAGE,
            ),
            &sudo,
        )?;

        info!("{}: starting pxe server and booting {}", host.hostname(), node.name);
        host.run_or_die(
            &format!(
                "podman exec {} /pxeboot {} -w {}",
                quote(&container),
                quote(&iso),
                quote(&key)
            ),
            &sudo,
        )?;
        Ok(())
    }

    fn teardown(&self, node: &Node, host: &dyn Endpoint) -> Result<()> {
        host.run(
            &format!("podman rm -f {}", quote(&Self::container(node))),
            &RunOptions::new().sudo(),
        )?;
        Ok(())
    }

    fn logs(&self, node: &Node, host: &dyn Endpoint) -> Result<Option<String>> {
        let result = host.run(
            &format!("podman logs {}", quote(&Self::container(node))),
            &RunOptions::new().sudo().quiet(),
        )?;
        Ok(result.success().then_some(result.out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BmcConfig;
    use crate::exec::{EndpointKind, ExecutionResult};
    use crate::node::NodeRole;
    use crate::testing::{self, MockEndpoint};
    use std::net::Ipv4Addr;

    fn node(kind: NodeKind) -> Node {
        let mut config = testing::node_config("c1-worker-1", kind, "localhost");
        config.ip = Some(Ipv4Addr::new(192, 168, 122, 51));
        if kind == NodeKind::Physical {
            config.bmc = Some(BmcConfig {
                address: "10.1.1.1".into(),
                user: "root".into(),
                password: "calvin".into(),
            });
        }
        Node::from_config("c1", NodeRole::Worker, &config)
    }

    fn env(mocks: &testing::MockServices) -> BootEnv {
        BootEnv {
            services: mocks.services(),
            cluster: Arc::new(testing::cluster_config("c1", 1, 1)),
            media: BootMedia::new(PathBuf::from("/root/iso/c1-x86_64.iso"), Some("http://10.0.0.1/iso/")),
            ssh_key: None,
        }
    }

    #[test]
    fn test_media_url() {
        let media = BootMedia::new(PathBuf::from("/srv/a.iso"), Some("http://h/iso/"));
        assert_eq!(media.url, "http://h/iso/a.iso");
        let media = BootMedia::new(PathBuf::from("/srv/a.iso"), None);
        assert_eq!(media.url, "file:///srv/a.iso");
    }

    #[test]
    fn test_vm_start_creates_disk_then_domain() {
        let mocks = testing::MockServices::new();
        let host = MockEndpoint::new("localhost", EndpointKind::Local);
        strategy_for(NodeKind::Vm)
            .start(&node(NodeKind::Vm), &host, &env(&mocks))
            .unwrap();

        let cmds = host.commands();
        let disk = cmds.iter().position(|c| c.contains("qemu-img create")).unwrap();
        let domain = cmds.iter().position(|c| c.contains("virt-install")).unwrap();
        assert!(disk < domain);
        assert!(cmds[domain].contains("mac=52:54:00:00:00:01"));
        assert!(cmds[domain].contains("/home/c1_guests_images/c1-worker-1.qcow2"));
        assert_eq!(host.copies().len(), 1);
    }

    #[test]
    fn test_vm_start_surfaces_failure() {
        let mocks = testing::MockServices::new();
        let host = MockEndpoint::new("localhost", EndpointKind::Local);
        host.respond("virt-install", ExecutionResult::new("", "no bridge", 1));
        let err = strategy_for(NodeKind::Vm)
            .start(&node(NodeKind::Vm), &host, &env(&mocks))
            .unwrap_err();
        assert!(matches!(err, CdaError::CommandFailed { code: 1, .. }));
    }

    #[test]
    fn test_vm_teardown_tolerates_missing_domain() {
        let host = MockEndpoint::new("h1", EndpointKind::Remote);
        host.respond("virsh destroy", ExecutionResult::new("", "domain not found", 1));
        strategy_for(NodeKind::Vm)
            .teardown(&node(NodeKind::Vm), &host)
            .unwrap();
        assert!(host.ran("virsh undefine --nvram c1-worker-1"));
        assert!(host.ran("rm -f /home/c1_guests_images/c1-worker-1.qcow2"));
    }

    #[test]
    fn test_physical_boots_through_bmc() {
        let mocks = testing::MockServices::new();
        let host = MockEndpoint::new("localhost", EndpointKind::Local);
        strategy_for(NodeKind::Physical)
            .start(&node(NodeKind::Physical), &host, &env(&mocks))
            .unwrap();
        assert!(host.commands().is_empty());
        assert_eq!(
            mocks.events.entries(),
            vec!["boot: 10.1.1.1 http://10.0.0.1/iso/c1-x86_64.iso".to_string()]
        );
    }

    #[test]
    fn test_physical_without_bmc_is_config_error() {
        let mocks = testing::MockServices::new();
        let host = MockEndpoint::new("localhost", EndpointKind::Local);
        let mut n = node(NodeKind::Physical);
        n.bmc = None;
        assert!(matches!(
            strategy_for(NodeKind::Physical).start(&n, &host, &env(&mocks)),
            Err(CdaError::Config(_))
        ));
    }

    #[test]
    fn test_accelerator_pxeboot() {
        let mocks = testing::MockServices::new();
        let host = MockEndpoint::new("h2", EndpointKind::Remote);
        strategy_for(NodeKind::Accelerator)
            .start(&node(NodeKind::Accelerator), &host, &env(&mocks))
            .unwrap();
        assert!(host.ran("podman run --pull always"));
        assert!(host.ran("podman exec c1-worker-1-pxeboot /pxeboot /root/iso/c1-x86_64.iso"));
    }
}
