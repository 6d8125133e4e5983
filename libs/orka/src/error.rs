//! Cluster client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrkaError {
    /// The 1 s reachability probe failed; the cluster endpoint is down or
    /// the URL is wrong.
    #[error("failed to connect to the Orka cluster: {0}")]
    Unreachable(String),

    /// The configured token lacks the privileges the integration needs.
    #[error("the provided Orka token is not valid")]
    Unauthorized,

    /// Delete targeted a VM the cluster no longer knows. Callers treat this
    /// as success; it is the only place "not found" is interpreted.
    #[error("vm {0} not found")]
    VmNotFound(String),

    /// A CLI invocation exited non-zero.
    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },

    /// The CLI produced output that does not match the expected JSON shape.
    #[error("unexpected CLI output: {0}")]
    Decode(#[from] serde_json::Error),

    /// A deploy answered with an empty result set.
    #[error("cluster returned an empty deploy response")]
    EmptyDeploy,
}

impl OrkaError {
    /// True when a delete can be considered already done.
    pub fn is_vm_not_found(&self) -> bool {
        matches!(self, OrkaError::VmNotFound(_))
    }
}
