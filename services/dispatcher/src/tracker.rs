//! Orphan-VM reconciler.
//!
//! Tracks every VM whose agent started executing and periodically checks
//! that the backend still knows a runner by that name. A VM that misses two
//! consecutive sweeps is considered orphaned (its provisioning task died
//! after `track` but before cleanup, e.g. a process crash) and is
//! force-deleted. Lookup errors never count as a strike.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_github::ActionsApi;
use bridge_orka::OrkaApi;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ORPHAN_STRIKE_LIMIT: u32 = 2;

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct VmTracker {
    orka: Arc<dyn OrkaApi>,
    actions: Arc<dyn ActionsApi>,
    tracked: Mutex<HashMap<String, u32>>,
}

impl VmTracker {
    pub fn new(orka: Arc<dyn OrkaApi>, actions: Arc<dyn ActionsApi>) -> Self {
        Self {
            orka,
            actions,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, vm_name: &str) {
        debug!(vm_name, "now tracking VM for orphaned VM detection");
        self.tracked
            .lock()
            .expect("tracker lock poisoned")
            .insert(vm_name.to_string(), 0);
    }

    pub fn untrack(&self, vm_name: &str) {
        debug!(vm_name, "stopping tracking VM for orphaned VM detection");
        self.tracked
            .lock()
            .expect("tracker lock poisoned")
            .remove(vm_name);
    }

    /// Run the sweep loop until the root scope is revoked.
    pub async fn run(&self, cancel: CancellationToken, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "starting orphaned VM reconciler");

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("orphaned VM reconciler shutting down");
                    return;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// One reconciliation pass over every tracked VM.
    pub async fn sweep(&self) {
        let vm_names: Vec<String> = {
            let tracked = self.tracked.lock().expect("tracker lock poisoned");
            tracked.keys().cloned().collect()
        };

        if vm_names.is_empty() {
            debug!("no VMs to check for orphans");
            return;
        }

        for vm_name in vm_names {
            match self.actions.get_runner(&vm_name).await {
                Err(err) => {
                    // An API blip is not evidence the VM is orphaned.
                    warn!(vm_name = %vm_name, error = %err, "failed to check backend for runner");
                }
                Ok(Some(_)) => {
                    let mut tracked = self.tracked.lock().expect("tracker lock poisoned");
                    if let Some(strikes) = tracked.get_mut(&vm_name) {
                        *strikes = 0;
                    }
                    debug!(vm_name = %vm_name, "VM is healthy and registered");
                }
                Ok(None) => {
                    let strikes = {
                        let mut tracked = self.tracked.lock().expect("tracker lock poisoned");
                        match tracked.get_mut(&vm_name) {
                            // Untracked by a racing cleanup while we polled.
                            None => continue,
                            Some(strikes) => {
                                *strikes += 1;
                                *strikes
                            }
                        }
                    };

                    warn!(
                        vm_name = %vm_name,
                        strikes,
                        limit = ORPHAN_STRIKE_LIMIT,
                        "VM has no registered runner"
                    );

                    if strikes >= ORPHAN_STRIKE_LIMIT {
                        error!(vm_name = %vm_name, "VM is orphaned, forcing deletion");
                        self.cleanup_orphaned_vm(&vm_name).await;
                    }
                }
            }
        }
    }

    async fn cleanup_orphaned_vm(&self, vm_name: &str) {
        match self.orka.delete_vm(vm_name).await {
            Ok(()) => {}
            Err(err) if err.is_vm_not_found() => {}
            Err(err) => {
                error!(vm_name = %vm_name, error = %err, "failed to delete orphaned VM");
                return;
            }
        }

        self.untrack(vm_name);
        info!(vm_name = %vm_name, "successfully deleted orphaned VM");
    }

    /// Whether a VM is currently tracked. Exposed for the reconciler's
    /// scenario tests.
    pub fn is_tracked(&self, vm_name: &str) -> bool {
        self.tracked
            .lock()
            .expect("tracker lock poisoned")
            .contains_key(vm_name)
    }
}
