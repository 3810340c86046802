use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{
    errors::{DomainError, DomainResult},
    models::DeliveryAttempt,
    repositories::MessageRepository,
};

pub struct GetMessageAttemptsUseCase {
    repo: Arc<dyn MessageRepository>,
}

impl GetMessageAttemptsUseCase {
    pub fn new(repo: Arc<dyn MessageRepository>) -> Self {
        Self { repo }
    }

    /// Attempt history, newest first.
    pub async fn execute(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> DomainResult<Vec<DeliveryAttempt>> {
        // Other users' messages look missing.
        self.repo
            .find_by_id(message_id)
            .await?
            .filter(|message| message.user_id() == user_id)
            .ok_or(DomainError::MessageNotFound(message_id))?;

        Ok(self.repo.list_attempts(message_id).await?)
    }
}
