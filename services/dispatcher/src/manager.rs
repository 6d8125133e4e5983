//! Runner manager: session acquisition and the serial message loop.
//!
//! The loop is strictly receive → handle → acquire → delete. A message is
//! deleted only after the handler (and the acquire pass it requested)
//! succeeded; on handler failure the error propagates and the backend
//! redelivers. `last_message_id` always names the last successfully handled
//! message and is never zero when a delete goes out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bridge_github::types::{ScaleSetMessage, ScaleSetSession};
use bridge_github::{ActionsApi, ActionsError};
use bridge_retry::sleep_or_cancel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::queue::MessageQueueManager;

/// The only message type the backend currently emits for scale sets.
pub const JOB_MESSAGES_TYPE: &str = "RunnerScaleSetJobMessages";

const SESSION_CREATION_MAX_RETRIES: u32 = 10;
const SESSION_RETRY_SPACING: Duration = Duration::from_secs(30);

/// Per-message callback; returns the runner-request ids to acquire.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ScaleSetMessage) -> anyhow::Result<Vec<i64>>;
}

pub struct RunnerManager {
    cancel: CancellationToken,
    queue: MessageQueueManager,
    last_message_id: i64,
    initial_message: Option<ScaleSetMessage>,
}

impl RunnerManager {
    /// Create the session (with bounded retry) and synthesize the initial
    /// statistics message.
    pub async fn new(
        cancel: CancellationToken,
        actions: Arc<dyn ActionsApi>,
        scale_set_id: i64,
    ) -> anyhow::Result<Self> {
        let session = create_session_with_retry(&cancel, actions.as_ref(), scale_set_id)
            .await
            .context("failed to create session")?;

        let initial_message = build_initial_message(actions.as_ref(), scale_set_id, &session)
            .await
            .context("failed to create initial message")?;

        Ok(Self {
            cancel,
            queue: MessageQueueManager::new(actions, scale_set_id, session),
            last_message_id: 0,
            initial_message: Some(initial_message),
        })
    }

    /// Drive one handler invocation: the pending initial message if present,
    /// otherwise the next live message (receive → handle → acquire → delete).
    ///
    /// Returns `Ok(())` without handling anything when the root scope is
    /// revoked.
    pub async fn process_messages(&mut self, handler: &dyn MessageHandler) -> anyhow::Result<()> {
        if let Some(initial) = self.initial_message.clone() {
            let acquire = handler
                .handle(&initial)
                .await
                .context("failed to process initial message")?;
            self.acquire_jobs(&acquire).await?;
            self.initial_message = None;
            return Ok(());
        }

        let cancel = self.cancel.clone();
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.queue.receive_next_message(self.last_message_id) => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    error!(error = %err, "unable to get the next message from the message queue");
                    continue;
                }
            };

            // A long poll that elapsed with no data; go around again.
            let Some(message) = message else { continue };

            let acquire = handler
                .handle(&message)
                .await
                .with_context(|| format!("unable to handle message {}", message.message_id))?;
            self.acquire_jobs(&acquire).await?;

            self.last_message_id = message.message_id;
            self.queue
                .delete_message(message.message_id)
                .await
                .with_context(|| format!("unable to delete message with id {}", message.message_id))?;
            info!(message_id = message.message_id, "successfully deleted message");

            return Ok(());
        }
    }

    /// Claim available jobs; a no-op for an empty list.
    pub async fn acquire_jobs(&mut self, request_ids: &[i64]) -> anyhow::Result<()> {
        if request_ids.is_empty() {
            return Ok(());
        }

        info!(count = request_ids.len(), ids = ?request_ids, "acquiring jobs");
        let acquired = self
            .queue
            .acquire_jobs(request_ids)
            .await
            .context("unable to acquire jobs from the queue")?;
        info!(
            requested = request_ids.len(),
            acquired = acquired.len(),
            "successfully acquired jobs"
        );
        Ok(())
    }

    /// Tear down the message session.
    pub async fn close(&mut self) {
        self.queue.close().await;
    }
}

async fn create_session_with_retry(
    cancel: &CancellationToken,
    actions: &dyn ActionsApi,
    scale_set_id: i64,
) -> anyhow::Result<ScaleSetSession> {
    let owner = session_owner();
    let mut retries = 0u32;

    loop {
        let err = match actions.create_message_session(scale_set_id, &owner).await {
            Ok(session) => return Ok(session),
            Err(err) => err,
        };

        if err.is_client_side() {
            info!(
                "unable to create message session. The error indicates something is wrong on \
                 the client side, won't make any retry"
            );
            return Err(anyhow::Error::new(err).context("create message session request failed"));
        }

        retries += 1;
        if retries >= SESSION_CREATION_MAX_RETRIES {
            return Err(anyhow::Error::new(err).context(format!(
                "create message session failed since it exceeded the {SESSION_CREATION_MAX_RETRIES} retry limit"
            )));
        }

        info!(error = %err, "unable to create message session. Will try again in 30 seconds");
        if !sleep_or_cancel(SESSION_RETRY_SPACING, cancel).await {
            anyhow::bail!("session creation canceled");
        }
    }
}

fn session_owner() -> String {
    let host = gethostname::gethostname();
    let host = host.to_string_lossy();
    if host.is_empty() {
        let fallback = Uuid::new_v4().to_string();
        info!(owner = %fallback, "could not get hostname, falling back to a random owner name");
        fallback
    } else {
        host.into_owned()
    }
}

/// Synthesize the handler's first input from the session statistics: the
/// acquirable-jobs snapshot when there is outstanding work, otherwise an
/// empty body that the processor treats as statistics-only.
async fn build_initial_message(
    actions: &dyn ActionsApi,
    scale_set_id: i64,
    session: &ScaleSetSession,
) -> Result<ScaleSetMessage, ActionsError> {
    let statistics = session.statistics.unwrap_or_default();
    info!(
        available = statistics.total_available_jobs,
        assigned = statistics.total_assigned_jobs,
        registered = statistics.total_registered_runners,
        "current runner scale set statistics"
    );

    let body = if statistics.total_available_jobs > 0 || statistics.total_assigned_jobs > 0 {
        let acquirable = actions.get_acquirable_jobs(scale_set_id).await?;
        serde_json::to_string(&acquirable.jobs)
            .map_err(|e| ActionsError::Unexpected(format!("marshal acquirable jobs failed: {e}")))?
    } else {
        String::new()
    };

    Ok(ScaleSetMessage {
        message_id: 0,
        message_type: JOB_MESSAGES_TYPE.to_string(),
        body,
        statistics: Some(statistics),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_owner_is_never_empty() {
        assert!(!session_owner().is_empty());
    }
}
