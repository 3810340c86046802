use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::{
    application::services::scheduler::{ScheduleHandle, Scheduler},
    domain::{
        errors::{DomainError, DomainResult},
        models::{DeliveryChannel, Message, MessageDraft, RecurrencePattern},
        repositories::{MessageRepository, UserRepository},
    },
};

pub struct ScheduleMessageUseCase {
    users: Arc<dyn UserRepository>,
    messages: Arc<dyn MessageRepository>,
    scheduler: Arc<dyn Scheduler>,
}

pub struct ScheduleMessageRequest {
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    pub deliver_at: DateTime<Utc>,
    pub timezone: String,
    pub channel: DeliveryChannel,
    pub recurrence: RecurrencePattern,
    pub reminder_minutes: Option<u32>,
}

pub struct ScheduleMessageResponse {
    pub message_id: Uuid,
    pub handle: ScheduleHandle,
}

impl ScheduleMessageUseCase {
    pub fn new(
        users: Arc<dyn UserRepository>,
        messages: Arc<dyn MessageRepository>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            users,
            messages,
            scheduler,
        }
    }

    pub async fn execute(
        &self,
        request: ScheduleMessageRequest,
    ) -> DomainResult<ScheduleMessageResponse> {
        if self.users.find_by_id(request.user_id).await?.is_none() {
            return Err(DomainError::Validation(format!(
                "user {} does not exist",
                request.user_id
            )));
        }

        let message = Message::new(
            MessageDraft {
                user_id: request.user_id,
                title: request.title,
                body: request.body,
                deliver_at: request.deliver_at,
                timezone: request.timezone,
                channel: request.channel,
                recurrence: request.recurrence,
                reminder_minutes: request.reminder_minutes,
            },
            Utc::now(),
        )?;
        self.messages.insert(&message).await?;

        let handle = self
            .scheduler
            .schedule(message.id(), message.deliver_at())
            .await?;
        info!(message_id = %message.id(), user_id = %message.user_id(), "message created");

        Ok(ScheduleMessageResponse {
            message_id: message.id(),
            handle,
        })
    }
}
