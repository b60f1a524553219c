//! Extra configuration steps as local scripts

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ExtraConfigStep;
use crate::error::Result;
use crate::exec::{quote, Endpoint, RunOptions};
use crate::services::ExtraConfigRunner;

/// Runs each step's script with the cluster's kubeconfig in its environment
pub struct ScriptExtraConfig {
    local: Arc<dyn Endpoint>,
    kubeconfig: PathBuf,
}

impl ScriptExtraConfig {
    pub fn new(local: Arc<dyn Endpoint>, kubeconfig: PathBuf) -> Self {
        Self { local, kubeconfig }
    }
}

impl ExtraConfigRunner for ScriptExtraConfig {
    fn run(&self, step: &ExtraConfigStep) -> Result<()> {
        let options = RunOptions::new()
            .env("KUBECONFIG", self.kubeconfig.display().to_string())
            .env("CDA_STEP", step.name.clone());
        self.local
            .run_or_die(&quote(&step.script.display().to_string()), &options)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdaError;
    use crate::exec::{EndpointKind, ExecutionResult};
    use crate::testing::MockEndpoint;

    #[test]
    fn test_failing_script_fails_the_step() {
        let local = Arc::new(MockEndpoint::new("localhost", EndpointKind::Local));
        let runner = ScriptExtraConfig::new(
            Arc::clone(&local) as Arc<dyn Endpoint>,
            PathBuf::from("/tmp/kubeconfig.c1"),
        );
        let step = ExtraConfigStep {
            name: "sriov".into(),
            script: PathBuf::from("/opt/cda/sriov setup.sh"),
        };
        runner.run(&step).unwrap();
        assert!(local.ran("'/opt/cda/sriov setup.sh'"));

        local.respond("sriov", ExecutionResult::new("", "boom", 1));
        assert!(matches!(runner.run(&step), Err(CdaError::CommandFailed { .. })));
    }
}
