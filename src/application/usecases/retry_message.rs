use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    application::services::scheduler::{ScheduleHandle, Scheduler},
    domain::{
        errors::{DomainError, DomainResult},
        models::MessageStatus,
        repositories::MessageRepository,
    },
};

/// Manual retry of a message that ran out of automatic attempts.
pub struct RetryMessageUseCase {
    messages: Arc<dyn MessageRepository>,
    scheduler: Arc<dyn Scheduler>,
}

pub struct RetryMessageRequest {
    pub user_id: Uuid,
    pub message_id: Uuid,
    /// Defaults to now.
    pub deliver_at: Option<DateTime<Utc>>,
}

impl RetryMessageUseCase {
    pub fn new(messages: Arc<dyn MessageRepository>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            messages,
            scheduler,
        }
    }

    pub async fn execute(&self, request: RetryMessageRequest) -> DomainResult<ScheduleHandle> {
        let message = self
            .messages
            .find_by_id(request.message_id)
            .await?
            .filter(|message| message.user_id() == request.user_id)
            .ok_or(DomainError::MessageNotFound(request.message_id))?;

        if message.status() != MessageStatus::Failed {
            return Err(DomainError::InvalidTransition {
                from: message.status(),
                to: MessageStatus::Scheduled,
            });
        }

        let deliver_at = request.deliver_at.unwrap_or_else(Utc::now);
        self.scheduler.schedule(message.id(), deliver_at).await
    }
}
