use std::sync::Arc;

use crate::domain::{
    errors::{DomainError, DomainResult},
    models::{Message, MessageStatus},
    repositories::MessageRepository,
};

const MAX_LIMIT: u32 = 500;

/// Operator view of messages left `failed`, oldest delivery time first.
pub struct ListFailedMessagesUseCase {
    repo: Arc<dyn MessageRepository>,
}

impl ListFailedMessagesUseCase {
    pub fn new(repo: Arc<dyn MessageRepository>) -> Self {
        Self { repo }
    }

    pub async fn execute(&self, limit: u32) -> DomainResult<Vec<Message>> {
        if limit == 0 {
            return Err(DomainError::Validation("limit must be positive".into()));
        }
        let limit = limit.min(MAX_LIMIT);
        Ok(self.repo.find_by_status(MessageStatus::Failed, limit).await?)
    }
}
