/*!
 * cda - Cluster Deployment Automation
 *
 * Provisions and tears down multi-node clusters across a local host and any
 * number of remote hosts:
 * - Resilient SSH endpoints with login-strategy rotation and reconnect
 * - Non-blocking capture of long-running command output
 * - Parallel node provisioning with explicit barriers between phases
 * - Known-state polling against the install backend with fail-fast on errors
 * - Correlation of booted workers to their intended identity
 *
 * External systems (install backend, cluster API, DHCP, boot controllers,
 * bridge network) are reached through the traits in [`services`].
 */

pub mod adapters;
pub mod boot;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod node;
pub mod node_group;
pub mod orchestrator;
pub mod pool;
pub mod services;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{ClusterConfig, ClusterKind, Phase, StepSet, TimingConfig};
pub use error::{CdaError, Result};
pub use exec::{Endpoint, EndpointKind, EndpointRegistry, ExecutionResult, RunOptions};
pub use node::{Node, NodeKind, NodeRole};
pub use orchestrator::Orchestrator;
pub use services::Services;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
