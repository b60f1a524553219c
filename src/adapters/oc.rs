//! Cluster API through the `oc` client

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CdaError, Result};
use crate::exec::{quote, Endpoint, ExecutionResult, RunOptions};
use crate::services::ClusterApi;

#[derive(Debug, Deserialize)]
struct CsrList {
    #[serde(default)]
    items: Vec<Csr>,
}

#[derive(Debug, Deserialize)]
struct Csr {
    metadata: Metadata,
    #[serde(default)]
    status: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

impl Csr {
    /// Neither approved nor denied yet
    fn is_pending(&self) -> bool {
        match &self.status {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

pub struct OcClusterApi {
    local: Arc<dyn Endpoint>,
    kubeconfig: PathBuf,
}

impl OcClusterApi {
    pub fn new(local: Arc<dyn Endpoint>, kubeconfig: PathBuf) -> Self {
        Self { local, kubeconfig }
    }

    fn run(&self, args: &str) -> Result<ExecutionResult> {
        let options = RunOptions::new()
            .env("KUBECONFIG", self.kubeconfig.display().to_string())
            .quiet();
        self.local.run(&format!("oc {}", args), &options)
    }

    fn run_or_die(&self, args: &str) -> Result<ExecutionResult> {
        let result = self.run(args)?;
        if !result.success() {
            return Err(CdaError::ClusterApi(format!(
                "oc {} failed (rc={}): {}",
                args,
                result.returncode,
                result.err.trim()
            )));
        }
        Ok(result)
    }
}

impl ClusterApi for OcClusterApi {
    fn is_ready(&self, node: &str) -> Result<bool> {
        let jsonpath = r#"-o jsonpath='{.status.conditions[?(@.type=="Ready")].status}'"#;
        let result = self.run(&format!("get node {} {}", quote(node), jsonpath))?;
        if !result.success() {
            // Not registered yet
            debug!("node {} not found: {}", node, result.err.trim());
            return Ok(false);
        }
        Ok(result.out.trim() == "True")
    }

    fn approve_pending_csrs(&self) -> Result<usize> {
        let result = self.run_or_die("get csr -o json")?;
        let list: CsrList = serde_json::from_str(&result.out)?;
        let mut approved = 0;
        for csr in list.items.iter().filter(|c| c.is_pending()) {
            info!("Approving CSR {}", csr.metadata.name);
            self.run_or_die(&format!(
                "adm certificate approve {}",
                quote(&csr.metadata.name)
            ))?;
            approved += 1;
        }
        Ok(approved)
    }

    fn delete_node(&self, node: &str) -> Result<()> {
        self.run_or_die(&format!("delete node {} --ignore-not-found", quote(node)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::EndpointKind;
    use crate::testing::MockEndpoint;

    fn api() -> (OcClusterApi, Arc<MockEndpoint>) {
        let local = Arc::new(MockEndpoint::new("localhost", EndpointKind::Local));
        let api = OcClusterApi::new(
            Arc::clone(&local) as Arc<dyn Endpoint>,
            PathBuf::from("/tmp/kubeconfig.c1"),
        );
        (api, local)
    }

    #[test]
    fn test_is_ready() {
        let (api, local) = api();
        local.respond("get node w1", ExecutionResult::new("True", "", 0));
        local.respond("get node w2", ExecutionResult::new("False", "", 0));
        local.respond("get node w3", ExecutionResult::new("", "NotFound", 1));
        assert!(api.is_ready("w1").unwrap());
        assert!(!api.is_ready("w2").unwrap());
        assert!(!api.is_ready("w3").unwrap());
    }

    #[test]
    fn test_approves_only_pending() {
        let (api, local) = api();
        let csrs = serde_json::json!({"items": [
            {"metadata": {"name": "csr-a"}, "status": {}},
            {"metadata": {"name": "csr-b"}, "status": {"conditions": [{"type": "Approved"}]}},
            {"metadata": {"name": "csr-c"}}
        ]});
        local.respond("get csr", ExecutionResult::new(csrs.to_string(), "", 0));

        assert_eq!(api.approve_pending_csrs().unwrap(), 2);
        assert!(local.ran("oc adm certificate approve csr-a"));
        assert!(!local.ran("approve csr-b"));
        assert!(local.ran("oc adm certificate approve csr-c"));
    }

    #[test]
    fn test_delete_node_failure() {
        let (api, local) = api();
        local.respond("delete node", ExecutionResult::new("", "forbidden", 1));
        assert!(matches!(api.delete_node("w1"), Err(CdaError::ClusterApi(_))));
    }
}
