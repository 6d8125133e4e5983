//! Cluster client: lease and delete VMs.
//!
//! Construction is deliberately strict. `orka3 user set-token` can take up
//! to a minute to fail when the cluster is unreachable, so the client first
//! probes the REST endpoint with a 1 s timeout, then configures the CLI, and
//! finally runs a cheap privileged command to verify the token actually has
//! the access the integration needs.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::OrkaError;
use crate::exec::{exec_json, exec_string};
use crate::types::VmDeployResponse;

/// Cluster access configuration.
#[derive(Debug, Clone)]
pub struct OrkaSettings {
    pub url: String,
    pub token: String,
    pub namespace: String,
    /// `key=value` pairs attached to every deployed VM, if configured.
    pub vm_metadata: Option<String>,
}

/// Lease/delete capability the provisioner and reconciler program against.
#[async_trait]
pub trait OrkaApi: Send + Sync {
    /// Deploy a VM from `vm_config`; the cluster generates a unique name
    /// starting with `name_prefix`.
    async fn deploy_vm(
        &self,
        name_prefix: &str,
        vm_config: &str,
    ) -> Result<VmDeployResponse, OrkaError>;

    /// Delete a VM by name. [`OrkaError::VmNotFound`] means it was already
    /// gone, which callers treat as success.
    async fn delete_vm(&self, name: &str) -> Result<(), OrkaError>;
}

pub struct OrkaClient {
    settings: OrkaSettings,
}

impl OrkaClient {
    /// Probe the cluster, configure the CLI, and verify token privileges.
    pub async fn connect(settings: OrkaSettings) -> Result<Self, OrkaError> {
        probe_cluster(&settings).await?;

        exec_string("orka3", &["config", "set", "--api-url", &settings.url]).await?;
        exec_string("orka3", &["user", "set-token", &settings.token]).await?;

        // Cheap privileged call; an under-privileged token fails here rather
        // than at the first deploy.
        if let Err(err) = exec_string("orka3", &["node", "list"]).await {
            if let OrkaError::Command { ref output, .. } = err {
                if output.contains("Unauthorized") {
                    return Err(OrkaError::Unauthorized);
                }
            }
            return Err(err);
        }

        info!(url = %settings.url, namespace = %settings.namespace, "connected to Orka cluster");

        Ok(Self { settings })
    }
}

/// Fail fast when the cluster endpoint is unreachable.
async fn probe_cluster(settings: &OrkaSettings) -> Result<(), OrkaError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .map_err(|e| OrkaError::Unreachable(e.to_string()))?;

    let url = format!("{}/api/v1/cluster-info", settings.url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .bearer_auth(&settings.token)
        .send()
        .await
        .map_err(|e| OrkaError::Unreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(OrkaError::Unreachable(format!(
            "{url} answered {}",
            response.status()
        )));
    }

    Ok(())
}

#[async_trait]
impl OrkaApi for OrkaClient {
    async fn deploy_vm(
        &self,
        name_prefix: &str,
        vm_config: &str,
    ) -> Result<VmDeployResponse, OrkaError> {
        let mut args = vec![
            "vm",
            "deploy",
            name_prefix,
            "--config",
            vm_config,
            "--generate-name",
            "-o",
            "json",
            "--namespace",
            self.settings.namespace.as_str(),
        ];
        if let Some(metadata) = self.settings.vm_metadata.as_deref() {
            args.push("--metadata");
            args.push(metadata);
        }

        let deployed: Vec<VmDeployResponse> = exec_json("orka3", &args).await?;
        deployed.into_iter().next().ok_or(OrkaError::EmptyDeploy)
    }

    async fn delete_vm(&self, name: &str) -> Result<(), OrkaError> {
        let result = exec_string(
            "orka3",
            &[
                "vm",
                "delete",
                name,
                "--namespace",
                self.settings.namespace.as_str(),
            ],
        )
        .await;

        match result {
            Ok(output) if output == format!("Successfully deleted vm {name}") => Ok(()),
            Ok(output) => {
                // The CLI exited zero with unexpected output; log and accept.
                warn!(vm_name = %name, %output, "unexpected delete output");
                Ok(())
            }
            Err(OrkaError::Command { output, command }) => {
                if output.contains("not found") {
                    Err(OrkaError::VmNotFound(name.to_string()))
                } else {
                    Err(OrkaError::Command { output, command })
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = OrkaError::VmNotFound("vm-a".to_string());
        assert!(err.is_vm_not_found());

        let err = OrkaError::Command {
            command: "orka3 vm delete vm-a".to_string(),
            output: "cluster exploded".to_string(),
        };
        assert!(!err.is_vm_not_found());
    }
}
