//! Message processor: the concurrent job-dispatch pipeline.
//!
//! Each handled message fans out into short-lived per-job tasks. Three
//! lifetimes are in play:
//!
//! - the root scope (process), revoked on SIGINT/SIGTERM;
//! - the per-job scope, a child of the root, revoked on job completion,
//!   execution failure, provisioning failure, or the JobCompleted webhook;
//! - cleanup, which runs on a detached task once the job scope is revoked
//!   and therefore survives process shutdown races.
//!
//! # Invariants
//!
//! - For every accepted JobAssigned (within the provisioning budget) exactly
//!   one per-job task exists, and its cleanup hook fires exactly once.
//! - A networking-class execution failure never revokes the job scope
//!   directly; the VM is only torn down when the JobCompleted webhook
//!   arrives (the agent may still be reporting out of band).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bridge_github::types::{
    JobAssigned, JobAvailable, JobCompleted, JobMessageKind, JobStarted, ScaleSetMessage,
};
use bridge_orka::ExecError;
use bridge_retry::sleep_or_cancel;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::manager::{MessageHandler, RunnerManager, JOB_MESSAGES_TYPE};
use crate::provisioner::{ProvisionedRunner, Provisioner};
use crate::tracker::VmTracker;

const CANCELED_STATUS: &str = "canceled";
const IGNORED_STATUS: &str = "ignored";
const ABANDONED_STATUS: &str = "abandoned";

/// Cancellation key for assigned jobs that arrive without a job id.
const DEFAULT_JOB_ID: &str = "missing-job-id";

const PROVISION_RETRY_SPACING: Duration = Duration::from_secs(15);

struct Shared {
    cancel: CancellationToken,
    provisioner: Arc<dyn Provisioner>,
    tracker: Arc<VmTracker>,
    tasks: TaskTracker,
    scale_set_name: String,
    upstream_canceled: RwLock<HashSet<String>>,
    job_cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl Shared {
    fn is_upstream_canceled(&self, job_id: &str) -> bool {
        self.upstream_canceled
            .read()
            .expect("upstream set poisoned")
            .contains(job_id)
    }

    fn set_upstream_canceled(&self, job_id: &str) {
        self.upstream_canceled
            .write()
            .expect("upstream set poisoned")
            .insert(job_id.to_string());
    }

    fn remove_upstream_canceled(&self, job_id: &str) {
        self.upstream_canceled
            .write()
            .expect("upstream set poisoned")
            .remove(job_id);
    }

    fn store_job_cancel(&self, job_id: &str, token: CancellationToken) {
        self.job_cancels
            .lock()
            .expect("job cancel map poisoned")
            .insert(job_id.to_string(), token);
    }

    /// Revoke a job's scope, naming the trigger. Safe to call repeatedly:
    /// only the first call for a given id finds a scope to revoke.
    fn cancel_job_context(&self, job_id: &str, reason: &str) {
        let token = self
            .job_cancels
            .lock()
            .expect("job cancel map poisoned")
            .remove(job_id);

        match token {
            Some(token) => {
                info!(job_id, reason, "canceling job context");
                token.cancel();
            }
            None => {
                debug!(job_id, reason, "job context already canceled or not found");
            }
        }
    }
}

pub struct MessageProcessor {
    shared: Arc<Shared>,
}

impl MessageProcessor {
    pub fn new(
        cancel: CancellationToken,
        provisioner: Arc<dyn Provisioner>,
        tracker: Arc<VmTracker>,
        scale_set_name: String,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cancel,
                provisioner,
                tracker,
                tasks: TaskTracker::new(),
                scale_set_name,
                upstream_canceled: RwLock::new(HashSet::new()),
                job_cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Drive the manager's message loop until the root scope is revoked or a
    /// handler failure bubbles up.
    pub async fn run(&self, manager: &mut RunnerManager) -> anyhow::Result<()> {
        loop {
            info!(scale_set = %self.shared.scale_set_name, "waiting for message...");

            if self.shared.cancel.is_cancelled() {
                info!(
                    scale_set = %self.shared.scale_set_name,
                    "message processing service is stopped"
                );
                return Ok(());
            }

            manager
                .process_messages(self)
                .await
                .map_err(|err| err.context("could not get and process message"))?;
        }
    }

    /// Close the task tracker and wait (bounded) for in-flight per-job tasks
    /// and cleanup hooks to finish.
    pub async fn shutdown(&self, budget: Duration) {
        self.shared.tasks.close();
        if tokio::time::timeout(budget, self.shared.tasks.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for job tasks to finish cleanup");
        }
    }

    fn spawn_job_task(&self, job: JobAssigned) {
        let mut job_id = job.base.job_id;
        if job_id.is_empty() {
            job_id = DEFAULT_JOB_ID.to_string();
        }

        let job_token = self.shared.cancel.child_token();
        self.shared.store_job_cancel(&job_id, job_token.clone());

        let shared = self.shared.clone();
        self.shared
            .tasks
            .spawn(async move { run_job(shared, job_id, job_token).await });
    }
}

#[async_trait]
impl MessageHandler for MessageProcessor {
    async fn handle(&self, message: &ScaleSetMessage) -> anyhow::Result<Vec<i64>> {
        let shared = &self.shared;
        info!(
            message_id = message.message_id,
            message_type = %message.message_type,
            "processing message"
        );

        let Some(statistics) = message.statistics else {
            bail!("can't process message with empty statistics");
        };

        info!(
            available = statistics.total_available_jobs,
            acquired = statistics.total_acquired_jobs,
            assigned = statistics.total_assigned_jobs,
            running = statistics.total_running_jobs,
            registered = statistics.total_registered_runners,
            busy = statistics.total_busy_runners,
            idle = statistics.total_idle_runners,
            "runner scale set statistics"
        );

        if message.message_type != JOB_MESSAGES_TYPE {
            info!(message_type = %message.message_type, "skip message with unknown message type");
            return Ok(Vec::new());
        }

        // Initial message with statistics only.
        if message.message_id == 0 && message.body.is_empty() {
            return Ok(Vec::new());
        }

        let batched: Vec<Box<RawValue>> =
            serde_json::from_str(&message.body).map_err(|e| {
                anyhow::anyhow!("could not decode job messages: {e}")
            })?;

        info!(
            message_id = message.message_id,
            batch_size = batched.len(),
            "processing batched runner scale set job messages"
        );

        let required =
            (statistics.total_assigned_jobs - statistics.total_registered_runners).max(0);
        let mut provisioned = 0i64;
        let mut available_jobs: Vec<i64> = Vec::new();

        for raw in &batched {
            let kind: JobMessageKind = serde_json::from_str(raw.get())
                .map_err(|e| anyhow::anyhow!("could not decode job message type: {e}"))?;

            match kind.message_type.as_str() {
                "JobAvailable" => {
                    let job: JobAvailable = serde_json::from_str(raw.get())
                        .map_err(|e| anyhow::anyhow!("could not decode job available message: {e}"))?;
                    info!(
                        job_id = %job.base.job_id,
                        runner_request_id = job.base.runner_request_id,
                        "job available message received"
                    );
                    available_jobs.push(job.base.runner_request_id);
                }
                "JobAssigned" => {
                    let job: JobAssigned = serde_json::from_str(raw.get())
                        .map_err(|e| anyhow::anyhow!("could not decode job assigned message: {e}"))?;
                    info!(
                        job_id = %job.base.job_id,
                        runner_request_id = job.base.runner_request_id,
                        "job assigned message received"
                    );

                    if provisioned < required {
                        provisioned += 1;
                        info!(
                            provisioned,
                            required, "runner provisioning started for assigned job"
                        );
                        self.spawn_job_task(job);
                    }
                }
                "JobStarted" => {
                    let job: JobStarted = serde_json::from_str(raw.get())
                        .map_err(|e| anyhow::anyhow!("could not decode job started message: {e}"))?;
                    info!(
                        job_id = %job.base.job_id,
                        runner_request_id = job.base.runner_request_id,
                        runner_id = job.runner_id,
                        "job started message received"
                    );
                }
                "JobCompleted" => {
                    let job: JobCompleted = serde_json::from_str(raw.get())
                        .map_err(|e| anyhow::anyhow!("could not decode job completed message: {e}"))?;
                    info!(
                        job_id = %job.base.job_id,
                        runner_request_id = job.base.runner_request_id,
                        runner_id = job.runner_id,
                        runner_name = %job.runner_name,
                        result = %job.result,
                        "job completed message received"
                    );

                    shared.cancel_job_context(&job.base.job_id, "job completed webhook received");

                    let upstream_canceled = matches!(
                        job.result.as_str(),
                        CANCELED_STATUS | IGNORED_STATUS | ABANDONED_STATUS
                    );
                    if !job.base.job_id.is_empty() && upstream_canceled {
                        shared.set_upstream_canceled(&job.base.job_id);
                    }
                }
                other => {
                    info!(message_type = other, "unknown job message type");
                }
            }
        }

        Ok(available_jobs)
    }
}

enum ProvisionFailure {
    Canceled,
    UpstreamCanceled,
}

/// The per-job task: provision with retry, arm the cleanup hook, execute,
/// and emit the cleanup reason.
async fn run_job(shared: Arc<Shared>, job_id: String, job_token: CancellationToken) {
    let provisioned = match provision_with_retry(&shared, &job_token, &job_id).await {
        Ok(provisioned) => provisioned,
        Err(failure) => {
            match failure {
                ProvisionFailure::Canceled => {
                    info!(
                        scale_set = %shared.scale_set_name,
                        job_id = %job_id,
                        "provisioning canceled"
                    );
                }
                ProvisionFailure::UpstreamCanceled => {
                    error!(
                        scale_set = %shared.scale_set_name,
                        job_id = %job_id,
                        "unable to provision runner, upstream job is gone"
                    );
                }
            }
            shared.cancel_job_context(&job_id, "provisioning failed");
            shared.remove_upstream_canceled(&job_id);
            return;
        }
    };

    let vm_name = provisioned.runner.vm_name().to_string();

    // After-revoke hook: once the job scope is revoked — for any reason —
    // clean up on a detached task that no cancellation reaches.
    {
        let shared = shared.clone();
        let hook_token = job_token.clone();
        let vm_name = vm_name.clone();
        shared.tasks.clone().spawn(async move {
            hook_token.cancelled().await;
            info!(vm_name = %vm_name, "cleaning up resources after job context was canceled");
            shared.provisioner.cleanup_resources(&vm_name).await;
            shared.tracker.untrack(&vm_name);
        });
    }

    shared.tracker.track(&vm_name);

    info!(job_id = %job_id, vm_name = %vm_name, "starting execution");
    let mut execution = provisioned.runner.run(&job_token, &provisioned.commands).await;
    if job_token.is_cancelled() {
        execution = Err(ExecError::Canceled);
    }

    match &execution {
        Ok(()) => {
            info!(job_id = %job_id, "execution completed successfully. Cleaning up resources");
            shared.cancel_job_context(&job_id, "execution completed successfully");
        }
        Err(ExecError::Canceled) => {
            info!(job_id = %job_id, "job context canceled. Cleaning up resources");
            shared.cancel_job_context(&job_id, "job context was canceled");
        }
        Err(ExecError::Exit(status)) => {
            error!(
                job_id = %job_id,
                status, "execution failed with exit code. Cleaning up resources"
            );
            shared.cancel_job_context(&job_id, &format!("execution failed with exit code {status}"));
        }
        Err(err) if err.is_networking() => {
            warn!(
                job_id = %job_id,
                error = %err,
                "SSH connection dropped. Skipping cleanup, relying on JobCompleted webhook"
            );
        }
        Err(err) => {
            error!(job_id = %job_id, error = %err, "execution failed. Cleaning up resources");
            shared.cancel_job_context(&job_id, &format!("execution failed: {err}"));
        }
    }

    shared.remove_upstream_canceled(&job_id);
}

/// Retry provisioning every 15 s while the upstream job is still alive.
async fn provision_with_retry(
    shared: &Shared,
    job_token: &CancellationToken,
    job_id: &str,
) -> Result<ProvisionedRunner, ProvisionFailure> {
    let mut attempt = 1u32;

    while !shared.is_upstream_canceled(job_id) {
        let outcome = tokio::select! {
            _ = job_token.cancelled() => return Err(ProvisionFailure::Canceled),
            outcome = shared.provisioner.provision() => outcome,
        };

        match outcome {
            Ok(provisioned) => return Ok(provisioned),
            Err(err) => {
                error!(
                    scale_set = %shared.scale_set_name,
                    attempt,
                    error = %err,
                    "unable to provision runner"
                );
            }
        }

        if !sleep_or_cancel(PROVISION_RETRY_SPACING, job_token).await {
            return Err(ProvisionFailure::Canceled);
        }
        attempt += 1;
    }

    Err(ProvisionFailure::UpstreamCanceled)
}
