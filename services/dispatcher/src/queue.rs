//! Message-queue manager.
//!
//! Owns the one session this process holds against the scale set's message
//! queue. Each operation tries once; when the backend signals that the queue
//! token expired, the manager refreshes the session, atomically replaces it,
//! and retries exactly once. Any other failure propagates.

use std::sync::Arc;
use std::time::Duration;

use bridge_github::types::{ScaleSetMessage, ScaleSetSession};
use bridge_github::{ActionsApi, ActionsError};
use tracing::{debug, info, warn};

const SESSION_DELETE_BUDGET: Duration = Duration::from_secs(30);

pub struct MessageQueueManager {
    actions: Arc<dyn ActionsApi>,
    scale_set_id: i64,
    session: ScaleSetSession,
    closed: bool,
}

impl MessageQueueManager {
    pub fn new(actions: Arc<dyn ActionsApi>, scale_set_id: i64, session: ScaleSetSession) -> Self {
        Self {
            actions,
            scale_set_id,
            session,
            closed: false,
        }
    }

    /// Long-poll for the next message, refreshing the session once on token
    /// expiry.
    pub async fn receive_next_message(
        &mut self,
        last_message_id: i64,
    ) -> Result<Option<ScaleSetMessage>, ActionsError> {
        let received = self
            .actions
            .get_message(
                &self.session.message_queue_url,
                &self.session.message_queue_access_token,
                last_message_id,
            )
            .await;

        match received {
            Err(ActionsError::QueueTokenExpired(_)) => {
                info!("message queue token expired during receive, refreshing session");
                self.refresh_session().await?;
                self.actions
                    .get_message(
                        &self.session.message_queue_url,
                        &self.session.message_queue_access_token,
                        last_message_id,
                    )
                    .await
            }
            other => other,
        }
    }

    /// Delete a handled message, refreshing the session once on token expiry.
    pub async fn delete_message(&mut self, message_id: i64) -> Result<(), ActionsError> {
        let deleted = self
            .actions
            .delete_message(
                &self.session.message_queue_url,
                &self.session.message_queue_access_token,
                message_id,
            )
            .await;

        match deleted {
            Err(ActionsError::QueueTokenExpired(_)) => {
                info!("message queue token expired during delete, refreshing session");
                self.refresh_session().await?;
                self.actions
                    .delete_message(
                        &self.session.message_queue_url,
                        &self.session.message_queue_access_token,
                        message_id,
                    )
                    .await
            }
            other => other,
        }
    }

    /// Claim available jobs, refreshing the session once on token expiry.
    pub async fn acquire_jobs(&mut self, request_ids: &[i64]) -> Result<Vec<i64>, ActionsError> {
        let acquired = self
            .actions
            .acquire_jobs(
                self.scale_set_id,
                &self.session.message_queue_access_token,
                request_ids,
            )
            .await;

        match acquired {
            Err(ActionsError::QueueTokenExpired(_)) => {
                info!("message queue token expired during acquire, refreshing session");
                self.refresh_session().await?;
                self.actions
                    .acquire_jobs(
                        self.scale_set_id,
                        &self.session.message_queue_access_token,
                        request_ids,
                    )
                    .await
            }
            other => other,
        }
    }

    async fn refresh_session(&mut self) -> Result<(), ActionsError> {
        let session_id = self.session.session_id.ok_or_else(|| {
            ActionsError::Unexpected("session carries no id to refresh".to_string())
        })?;

        self.session = self
            .actions
            .refresh_message_session(self.scale_set_id, &session_id)
            .await?;
        Ok(())
    }

    /// Best-effort session teardown within a bounded window. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            debug!("session is already deleted");
            return;
        }
        self.closed = true;

        let Some(session_id) = self.session.session_id else {
            return;
        };

        info!(
            owner = %self.session.owner_name,
            session_id = %session_id,
            "deleting message session"
        );

        match tokio::time::timeout(
            SESSION_DELETE_BUDGET,
            self.actions
                .delete_message_session(self.scale_set_id, &session_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to delete message session"),
            Err(_) => warn!("timed out deleting message session"),
        }
    }
}
