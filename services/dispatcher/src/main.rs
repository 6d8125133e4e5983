//! Dispatcher entry point.
//!
//! Startup order matters: configuration and logging first, then the Actions
//! client (credential flow), idempotent scale-set re-registration, the
//! cluster client (fail-fast probe), and finally the reconciler, session,
//! and message loop. Shutdown unwinds in reverse: the loop exits on signal,
//! the session is deleted, in-flight cleanup hooks get a bounded window, and
//! the scale set is removed last.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_github::types::{RunnerScaleSet, ScaleSetLabel, ScaleSetSetting};
use bridge_github::{ActionsApi, ActionsClient, ActionsSettings, GitHubConfig};
use bridge_orka::{OrkaApi, OrkaClient, OrkaSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge_dispatcher::config::{Settings, DEFAULT_RUNNER_GROUP_ID};
use bridge_dispatcher::manager::RunnerManager;
use bridge_dispatcher::processor::MessageProcessor;
use bridge_dispatcher::provisioner::{Provisioner, RunnerProvisioner};
use bridge_dispatcher::tracker::{VmTracker, DEFAULT_SWEEP_INTERVAL};
use bridge_dispatcher::version;

/// How long shutdown waits for per-job tasks and cleanup hooks.
const SHUTDOWN_CLEANUP_BUDGET: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;
    init_tracing(&settings.log_level);

    info!("starting Orka Actions dispatcher");

    if settings.github_runner_version.is_empty() {
        let version = version::latest_runner_version(settings.github_token.as_deref())
            .await
            .context("failed to resolve the default runner version")?;
        settings.github_runner_version = version.to_string();
    } else {
        version::parse_runner_version(&settings.github_runner_version)
            .context("unsupported GITHUB_RUNNER_VERSION")?;
    }
    info!(runner_version = %settings.github_runner_version, "using runner version");

    let root = CancellationToken::new();
    spawn_signal_listener(root.clone());

    let github = GitHubConfig::parse(&settings.github_url)?;

    let runner = settings.runners[0].clone();
    let runner_group_id = if runner.id != 0 {
        runner.id
    } else {
        DEFAULT_RUNNER_GROUP_ID
    };

    let actions: Arc<dyn ActionsApi> = Arc::new(
        ActionsClient::connect(
            ActionsSettings {
                api_url: settings.github_api_url.clone(),
                app_id: settings.github_app_id,
                installation_id: settings.github_app_installation_id,
                private_key_pem: settings.github_app_private_key.clone(),
            },
            github,
        )
        .await
        .context("failed to authenticate with the Actions backend")?,
    );

    // Idempotent re-registration: a prior scale set with this name (e.g.
    // after an abrupt restart) is removed before creating the new one.
    if let Some(existing) = actions
        .get_runner_scale_set(runner_group_id, &runner.name)
        .await?
    {
        info!(scale_set_id = existing.id, "deleting previous scale set registration");
        actions.delete_runner_scale_set(existing.id).await?;
    }

    let scale_set = actions
        .create_runner_scale_set(&RunnerScaleSet {
            name: runner.name.clone(),
            runner_group_id,
            labels: vec![ScaleSetLabel {
                kind: "System".to_string(),
                name: runner.name.clone(),
            }],
            runner_setting: ScaleSetSetting {
                ephemeral: true,
                disable_update: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .await
        .with_context(|| format!("unable to create runner scale set {}", runner.name))?;
    info!(
        scale_set_id = scale_set.id,
        name = %scale_set.name,
        "registered runner scale set"
    );

    let orka: Arc<dyn OrkaApi> = Arc::new(
        OrkaClient::connect(OrkaSettings {
            url: settings.orka_url.clone(),
            token: settings.orka_token.clone(),
            namespace: settings.orka_namespace.clone(),
            vm_metadata: settings.orka_vm_metadata.clone(),
        })
        .await
        .context("unable to access the Orka cluster")?,
    );

    let settings = Arc::new(settings);

    let tracker = Arc::new(VmTracker::new(orka.clone(), actions.clone()));
    {
        let tracker = tracker.clone();
        let cancel = root.clone();
        tokio::spawn(async move { tracker.run(cancel, DEFAULT_SWEEP_INTERVAL).await });
    }

    let mut manager = RunnerManager::new(root.clone(), actions.clone(), scale_set.id)
        .await
        .context("failed to create runner manager")?;

    let provisioner: Arc<dyn Provisioner> = Arc::new(RunnerProvisioner::new(
        scale_set.clone(),
        actions.clone(),
        orka.clone(),
        settings.clone(),
    ));

    let processor = MessageProcessor::new(
        root.clone(),
        provisioner,
        tracker.clone(),
        scale_set.name.clone(),
    );

    if let Err(err) = processor.run(&mut manager).await {
        error!(
            error = %err,
            scale_set = %scale_set.name,
            "failed to process messages for runner scale set"
        );
    }

    info!("shutting down, performing cleanup");
    manager.close().await;
    processor.shutdown(SHUTDOWN_CLEANUP_BUDGET).await;

    if let Err(err) = actions.delete_runner_scale_set(scale_set.id).await {
        error!(error = %err, "error while deleting runner scale set");
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

fn spawn_signal_listener(root: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            error!(error = %err, "failed to listen for shutdown signals");
        }
        info!("received termination signal, revoking root scope");
        root.cancel();
    });
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }

    Ok(())
}
