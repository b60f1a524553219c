/*!
 * Command-line collaborator adapters
 *
 * Each adapter implements one collaborator trait from [`crate::services`] by
 * running a command-line tool through the local endpoint:
 *
 * - [`AicliBackend`]: install backend through `aicli`
 * - [`OcClusterApi`]: cluster API through `oc`
 * - [`VirshBridge`]: libvirt bridge, DHCP reservations and DNS entries
 * - [`RedfishBoot`]: virtual-media boot through the Redfish HTTPS API
 * - [`ScriptExtraConfig`]: pre/post steps as local scripts
 */

pub mod aicli;
pub mod extra;
pub mod oc;
pub mod redfish;
pub mod virsh;

use std::sync::Arc;

pub use aicli::AicliBackend;
pub use extra::ScriptExtraConfig;
pub use oc::OcClusterApi;
pub use redfish::RedfishBoot;
pub use virsh::VirshBridge;

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::exec::EndpointRegistry;
use crate::services::Services;

/// Wire every collaborator to its adapter on the local host
pub fn command_line_services(config: &ClusterConfig, registry: &EndpointRegistry) -> Result<Services> {
    let local = registry.local();
    let kubeconfig = config.kubeconfig_path();
    let bridge = Arc::new(VirshBridge::new(Arc::clone(&local), &config.base_dns_domain));

    Ok(Services {
        backend: Arc::new(AicliBackend::new(
            Arc::clone(&local),
            config.backend_url.as_deref(),
            &config.timing,
        )),
        cluster_api: Arc::new(OcClusterApi::new(Arc::clone(&local), kubeconfig.clone())),
        dhcp: Arc::clone(&bridge) as _,
        boot: Arc::new(RedfishBoot::new(&config.timing)?),
        bridge,
        extra: Arc::new(ScriptExtraConfig::new(local, kubeconfig)),
    })
}
