//! SSH command execution inside a leased VM.
//!
//! The executor dials the VM with password auth (cluster VMs expose a local
//! account, host keys are throwaway), streams a command script through an
//! interactive shell, and relays remote output line by line.
//!
//! # Invariants
//!
//! - Dialing retries up to [`MAX_DIAL_ATTEMPTS`] times with 3 s spacing and a
//!   10 s per-attempt timeout; cancellation aborts the loop immediately.
//! - While waiting on the session, cancellation closes the connection and
//!   returns [`ExecError::Canceled`]; a racing session error is never
//!   reported instead of the cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_DIAL_ATTEMPTS: u32 = 20;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_RETRY_SPACING: Duration = Duration::from_secs(3);

/// How a remote execution failed.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The VM never accepted a connection.
    #[error("failed to reach {addr} after {attempts} ssh dial attempts")]
    Connect { addr: String, attempts: u32 },

    /// The VM rejected the configured credentials.
    #[error("ssh password authentication rejected for user {0}")]
    Auth(String),

    /// The remote script exited non-zero.
    #[error("remote commands exited with status {0}")]
    Exit(u32),

    /// The job scope was revoked while executing.
    #[error("execution canceled")]
    Canceled,

    /// Protocol-level failure on an established connection.
    #[error("ssh session error: {0}")]
    Ssh(#[from] russh::Error),

    /// The channel closed without ever reporting an exit status.
    #[error("ssh channel closed before reporting an exit status")]
    Disconnected,
}

impl ExecError {
    /// Connection-class failures: the agent may still be alive and reporting
    /// to the backend out of band, so callers must not tear the VM down on
    /// this signal alone.
    pub fn is_networking(&self) -> bool {
        !matches!(self, ExecError::Exit(_) | ExecError::Canceled)
    }
}

/// One VM's SSH coordinates plus credentials.
#[derive(Debug, Clone)]
pub struct VmCommandExecutor {
    pub vm_ip: String,
    pub vm_port: u16,
    pub vm_name: String,
    pub username: String,
    pub password: String,
}

struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl VmCommandExecutor {
    /// Run `commands` through a remote shell, waiting for completion or
    /// cancellation.
    pub async fn execute_commands(
        &self,
        cancel: &CancellationToken,
        commands: &[String],
    ) -> Result<(), ExecError> {
        let addr = format!("{}:{}", self.vm_ip, self.vm_port);
        info!(vm_name = %self.vm_name, %addr, "starting execution on VM");

        let mut handle = self.connect_with_retries(cancel, &addr).await?;

        let authenticated = handle
            .authenticate_password(self.username.as_str(), self.password.as_str())
            .await?;
        if !authenticated {
            return Err(ExecError::Auth(self.username.clone()));
        }

        let mut channel = handle.channel_open_session().await?;
        channel.request_shell(true).await?;
        info!(vm_name = %self.vm_name, "remote shell started");

        let script = format!("{}\nexit\n", commands.join("\n"));
        channel.data(script.as_bytes()).await?;
        channel.eof().await?;

        let mut stdout = LineFramer::new(self.vm_name.clone());
        let mut stderr = LineFramer::new(self.vm_name.clone());
        let mut exit_status: Option<u32> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(vm_name = %self.vm_name, "canceled while waiting for execution");
                    let _ = handle
                        .disconnect(Disconnect::ByApplication, "job canceled", "en")
                        .await;
                    return Err(ExecError::Canceled);
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { ref data }) => stdout.push(data),
                    Some(ChannelMsg::ExtendedData { ref data, .. }) => stderr.push(data),
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = Some(status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        stdout.flush();
        stderr.flush();

        match exit_status {
            Some(0) => {
                info!(vm_name = %self.vm_name, "execution completed successfully");
                Ok(())
            }
            Some(status) => {
                warn!(vm_name = %self.vm_name, status, "remote commands failed");
                Err(ExecError::Exit(status))
            }
            None => {
                warn!(vm_name = %self.vm_name, "connection dropped before exit status");
                Err(ExecError::Disconnected)
            }
        }
    }

    async fn connect_with_retries(
        &self,
        cancel: &CancellationToken,
        addr: &str,
    ) -> Result<client::Handle<AcceptAnyHostKey>, ExecError> {
        let config = Arc::new(client::Config::default());

        for attempt in 1..=MAX_DIAL_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(ExecError::Canceled);
            }

            let dial = tokio::time::timeout(
                DIAL_TIMEOUT,
                client::connect(config.clone(), addr, AcceptAnyHostKey),
            );

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecError::Canceled),
                outcome = dial => outcome,
            };

            match outcome {
                Ok(Ok(handle)) => {
                    info!(vm_name = %self.vm_name, %addr, attempt, "ssh connection established");
                    return Ok(handle);
                }
                Ok(Err(err)) => {
                    warn!(
                        vm_name = %self.vm_name,
                        attempt,
                        max = MAX_DIAL_ATTEMPTS,
                        error = %err,
                        "failed to connect to VM"
                    );
                }
                Err(_) => {
                    warn!(
                        vm_name = %self.vm_name,
                        attempt,
                        max = MAX_DIAL_ATTEMPTS,
                        "ssh dial timed out"
                    );
                }
            }

            if !bridge_retry::sleep_or_cancel(DIAL_RETRY_SPACING, cancel).await {
                return Err(ExecError::Canceled);
            }
        }

        Err(ExecError::Connect {
            addr: addr.to_string(),
            attempts: MAX_DIAL_ATTEMPTS,
        })
    }
}

/// Re-frames a remote byte stream into timestamped per-line log records.
struct LineFramer {
    vm_name: String,
    buffer: String,
}

impl LineFramer {
    fn new(vm_name: String) -> Self {
        Self {
            vm_name,
            buffer: String::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(data));

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.emit(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.emit(rest.trim_end_matches(['\n', '\r']));
        }
    }

    fn emit(&self, line: &str) {
        info!(
            "[VM] - {} - {}: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            self.vm_name,
            line
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_networking_classification() {
        assert!(ExecError::Connect {
            addr: "10.0.0.1:22".to_string(),
            attempts: 20
        }
        .is_networking());
        assert!(ExecError::Disconnected.is_networking());
        assert!(ExecError::Auth("admin".to_string()).is_networking());
        assert!(!ExecError::Exit(1).is_networking());
        assert!(!ExecError::Canceled.is_networking());
    }

    #[test]
    fn test_line_framer_splits_on_newlines() {
        let mut framer = LineFramer::new("vm-a".to_string());
        framer.push(b"partial");
        assert_eq!(framer.buffer, "partial");

        framer.push(b" line\nnext");
        assert_eq!(framer.buffer, "next");

        framer.flush();
        assert!(framer.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_connect_aborts_immediately_on_cancel() {
        let executor = VmCommandExecutor {
            vm_ip: "127.0.0.1".to_string(),
            vm_port: 1,
            vm_name: "vm-a".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();

        let commands = vec!["true".to_string()];
        let err = executor
            .execute_commands(&cancel, &commands)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Canceled));
    }
}
