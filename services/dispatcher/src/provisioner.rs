//! Runner provisioner: one VM, one JIT runner, one bootstrap script.
//!
//! Provisioning deploys a fresh VM, resolves its reachable IP, registers a
//! JIT runner under a per-provisioner lock (the backend rejects concurrent
//! config generation for racing names), and hands back an executor plus the
//! rendered bootstrap script.
//!
//! Cleanup is two-phase and ordered: the runner must be deregistered from
//! the backend before the VM is deleted, otherwise the backend keeps
//! reporting a ghost runner for a machine that no longer exists.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bridge_github::types::{JitRunnerConfig, RunnerScaleSet};
use bridge_github::{ActionsApi, ActionsError};
use bridge_orka::types::VmDeployResponse;
use bridge_orka::{ExecError, OrkaApi, OrkaError, VmCommandExecutor};
use bridge_retry::BackoffPolicy;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;

/// Backend error text for a runner that is mid-job; cleanup loops until the
/// backend finishes unwinding it.
const RUNNER_BUSY_MARKER: &str = "is currently running a job and cannot be deleted";

const VM_DELETE_MAX_ATTEMPTS: u32 = 10;

/// Bootstrap script template. `$VERSION`, `$USERNAME` and `$JITCONFIG` are
/// substituted literally before transmission.
const COMMAND_TEMPLATE: [&str; 12] = [
    "set -e",
    "echo \"Downloading Git Action Runner from https://github.com/actions/runner/releases/download/v$VERSION/actions-runner-osx-$(uname -m | sed 's/86_//')-$VERSION.tar.gz\"",
    "mkdir -p /Users/$USERNAME/actions-runner",
    "curl -o /Users/$USERNAME/actions-runner/actions-runner.tar.gz -L https://github.com/actions/runner/releases/download/v$VERSION/actions-runner-osx-$(uname -m | sed 's/86_//')-$VERSION.tar.gz",
    "echo 'Git Action Runner download completed'",
    "echo 'Unarchiving Git Action Runner /Users/$USERNAME/actions-runner/actions-runner.tar.gz'",
    "cd /Users/$USERNAME/actions-runner",
    "tar xzf /Users/$USERNAME/actions-runner/actions-runner.tar.gz",
    "echo 'Git Action Runner unarchive completed'",
    "echo 'Starting Git Action Runner'",
    "/Users/$USERNAME/actions-runner/run.sh --jitconfig $JITCONFIG",
    "echo 'Git Action Runner exited'",
];

/// Something that can run the bootstrap script inside a VM.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn vm_name(&self) -> &str;
    async fn run(
        &self,
        cancel: &CancellationToken,
        commands: &[String],
    ) -> Result<(), ExecError>;
}

#[async_trait]
impl CommandRunner for VmCommandExecutor {
    fn vm_name(&self) -> &str {
        &self.vm_name
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        commands: &[String],
    ) -> Result<(), ExecError> {
        self.execute_commands(cancel, commands).await
    }
}

/// Result of a successful provisioning round.
pub struct ProvisionedRunner {
    pub runner: Box<dyn CommandRunner>,
    pub commands: Vec<String>,
}

/// Seam the message processor programs against.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Deploy a VM and register a JIT runner for it.
    async fn provision(&self) -> anyhow::Result<ProvisionedRunner>;

    /// Two-phase teardown: deregister the runner, then delete the VM.
    /// Infallible from the caller's perspective; failures are logged and the
    /// reconciler remains the backstop.
    async fn cleanup_resources(&self, vm_name: &str);
}

pub struct RunnerProvisioner {
    scale_set: RunnerScaleSet,
    actions: Arc<dyn ActionsApi>,
    orka: Arc<dyn OrkaApi>,
    settings: Arc<Settings>,
    jit_lock: Mutex<()>,
}

impl RunnerProvisioner {
    pub fn new(
        scale_set: RunnerScaleSet,
        actions: Arc<dyn ActionsApi>,
        orka: Arc<dyn OrkaApi>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            scale_set,
            actions,
            orka,
            settings,
            jit_lock: Mutex::new(()),
        }
    }

    async fn finish_provisioning(&self, vm: VmDeployResponse) -> anyhow::Result<ProvisionedRunner> {
        let vm_ip = self.real_vm_ip(&vm.ip)?;
        let vm_port = vm
            .ssh
            .ok_or_else(|| anyhow!("deploy response for {} carries no SSH port", vm.name))?;

        info!(vm_name = %vm.name, "creating runner config");
        let jit = self
            .create_runner(&vm.name)
            .await
            .with_context(|| format!("failed to create runner config for {}", vm.name))?;
        info!(vm_name = %vm.name, "created runner config");

        let executor = VmCommandExecutor {
            vm_ip,
            vm_port,
            vm_name: vm.name.clone(),
            username: self.settings.orka_vm_username.clone(),
            password: self.settings.orka_vm_password.clone(),
        };

        let commands = build_commands(
            &jit.encoded_jit_config,
            &self.settings.github_runner_version,
            &self.settings.orka_vm_username,
        );

        Ok(ProvisionedRunner {
            runner: Box::new(executor),
            commands,
        })
    }

    fn real_vm_ip(&self, reported_ip: &str) -> anyhow::Result<String> {
        if !self.settings.orka_enable_node_ip_mapping {
            return Ok(reported_ip.to_string());
        }

        match self.settings.orka_node_ip_mapping.get(reported_ip) {
            Some(mapped) if !mapped.is_empty() => Ok(mapped.clone()),
            _ => Err(anyhow!(
                "unable to retrieve VM IP from the provided node IP mapping"
            )),
        }
    }

    /// JIT creation is serialized: racing provisioning tasks must not hand
    /// the backend duplicate runner names.
    async fn create_runner(&self, runner_name: &str) -> Result<JitRunnerConfig, ActionsError> {
        debug!(runner_name, "waiting for lock to create runner");
        let _guard = self.jit_lock.lock().await;
        debug!(runner_name, "acquired lock to create runner");

        self.actions
            .create_jit_runner(self.scale_set.id, runner_name)
            .await
    }

    /// Wait for the agent to deregister itself; force-delete once the
    /// timeout budget is spent. Transient lookup errors do not consume the
    /// budget.
    async fn ensure_runner_deregistered(&self, vm_name: &str) -> Result<(), ActionsError> {
        info!(vm_name, "waiting for runner to deregister from the backend");

        if let Ok(None) = self.actions.get_runner(vm_name).await {
            info!(vm_name, "runner has cleanly deregistered");
            return Ok(());
        }

        let poll = self.settings.runner_deregistration_poll_interval;
        let mut budget = self.settings.runner_deregistration_timeout;
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match self.actions.get_runner(vm_name).await {
                Err(err) => {
                    warn!(vm_name, error = %err, "error checking runner registration status");
                }
                Ok(None) => {
                    info!(vm_name, "runner has cleanly deregistered");
                    return Ok(());
                }
                Ok(Some(_)) => {
                    budget = budget.saturating_sub(poll);
                    if budget.is_zero() {
                        warn!(
                            vm_name,
                            timeout = ?self.settings.runner_deregistration_timeout,
                            "runner did not deregister in time, force-deleting from the backend"
                        );
                        return self.force_delete_runner(vm_name).await;
                    }
                }
            }
        }
    }

    async fn force_delete_runner(&self, vm_name: &str) -> Result<(), ActionsError> {
        let Some(runner) = self.actions.get_runner(vm_name).await? else {
            info!(vm_name, "runner already deregistered, no force-deletion needed");
            return Ok(());
        };

        self.actions.delete_runner(runner.id).await?;
        info!(vm_name, runner_id = runner.id, "force-deleted runner from the backend");
        Ok(())
    }

    async fn delete_vm(&self, vm_name: &str) {
        info!(vm_name, "initiating deletion of Orka VM");

        let policy = BackoffPolicy::default();
        let result = bridge_retry::retry(
            &policy,
            VM_DELETE_MAX_ATTEMPTS,
            |err: &OrkaError| !err.is_vm_not_found(),
            || {
                let orka = &self.orka;
                async move { orka.delete_vm(vm_name).await }
            },
        )
        .await;

        match result {
            Ok(()) => info!(vm_name, "successfully deleted Orka VM"),
            Err(err) if err.is_vm_not_found() => {
                warn!(vm_name, "Orka VM not found (it may have already been deleted)");
            }
            Err(err) => error!(vm_name, error = %err, "error while deleting Orka VM"),
        }
    }
}

#[async_trait]
impl Provisioner for RunnerProvisioner {
    async fn provision(&self) -> anyhow::Result<ProvisionedRunner> {
        info!(prefix = %self.scale_set.name, "deploying Orka VM");
        let vm = self
            .orka
            .deploy_vm(&self.scale_set.name, &self.settings.orka_vm_config)
            .await
            .context("failed to deploy Orka VM")?;
        let vm_name = vm.name.clone();
        info!(vm_name = %vm_name, "deployed Orka VM");

        match self.finish_provisioning(vm).await {
            Ok(provisioned) => Ok(provisioned),
            Err(err) => {
                warn!(vm_name = %vm_name, "provisioning failed, cleaning up resources");
                self.cleanup_resources(&vm_name).await;
                Err(err)
            }
        }
    }

    async fn cleanup_resources(&self, vm_name: &str) {
        info!(vm_name, "starting resource cleanup");

        loop {
            match self.ensure_runner_deregistered(vm_name).await {
                Ok(()) => break,
                Err(err) if runner_still_busy(&err) => {
                    info!(vm_name, "runner is currently running a job, repeating deletion logic");
                    continue;
                }
                Err(err) => {
                    error!(
                        vm_name,
                        error = %err,
                        "failed to delete runner; the VM will not be deleted"
                    );
                    return;
                }
            }
        }

        self.delete_vm(vm_name).await;
    }
}

fn runner_still_busy(err: &ActionsError) -> bool {
    matches!(err, ActionsError::Api { message, .. } if message.contains(RUNNER_BUSY_MARKER))
}

fn build_commands(jit_config: &str, version: &str, username: &str) -> Vec<String> {
    COMMAND_TEMPLATE
        .iter()
        .map(|command| {
            command
                .replace("$JITCONFIG", jit_config)
                .replace("$VERSION", version)
                .replace("$USERNAME", username)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_build_commands_substitution() {
        let commands = build_commands("ZW5jb2RlZA==", "2.321.0", "admin");

        assert_eq!(commands.len(), COMMAND_TEMPLATE.len());
        assert_eq!(commands[0], "set -e");
        assert!(commands[1].contains("v2.321.0/actions-runner-osx-"));
        assert_eq!(commands[2], "mkdir -p /Users/admin/actions-runner");
        assert_eq!(
            commands[10],
            "/Users/admin/actions-runner/run.sh --jitconfig ZW5jb2RlZA=="
        );
        // The arch-detection subshell must survive substitution untouched.
        assert!(commands[3].contains("$(uname -m | sed 's/86_//')"));
        assert!(commands.iter().all(|c| !c.contains("$JITCONFIG")));
        assert!(commands.iter().all(|c| !c.contains("$VERSION")));
        assert!(commands.iter().all(|c| !c.contains("$USERNAME")));
    }

    #[test]
    fn test_runner_busy_detection() {
        let busy = ActionsError::Api {
            status: StatusCode::BAD_REQUEST,
            type_name: None,
            message: format!("runner vm-a {RUNNER_BUSY_MARKER}"),
        };
        assert!(runner_still_busy(&busy));

        let other = ActionsError::Api {
            status: StatusCode::BAD_REQUEST,
            type_name: None,
            message: "no such runner".to_string(),
        };
        assert!(!runner_still_busy(&other));

        assert!(!runner_still_busy(&ActionsError::Unexpected("x".into())));
    }
}
