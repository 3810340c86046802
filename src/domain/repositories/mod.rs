use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    errors::{DomainError, DomainResult},
    models::{DeliveryAttempt, DeliveryJob, Message, MessageStatus, NewJob, User},
};

const MODIFY_RETRIES: usize = 3;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn upsert(&self, user: &User) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, message: &Message) -> anyhow::Result<()>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Message>>;

    /// Replaces the stored record with `message` as a whole, but only while
    /// its stored status is still `expected`. Returns whether it was written.
    async fn update_if(&self, message: &Message, expected: MessageStatus) -> anyhow::Result<bool>;

    /// Scheduled messages whose delivery time is at or before `instant`,
    /// earliest first.
    async fn find_due_before(
        &self,
        instant: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>>;

    async fn find_by_status(&self, status: MessageStatus, limit: u32)
    -> anyhow::Result<Vec<Message>>;

    async fn find_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Message>>;

    async fn log_attempt(&self, attempt: DeliveryAttempt) -> anyhow::Result<()>;

    async fn list_attempts(&self, message_id: Uuid) -> anyhow::Result<Vec<DeliveryAttempt>>;
}

/// Durable job table behind the queue-backed scheduler.
///
/// Implementations must keep at most one active job per message id, and must
/// enforce it in storage so that workers in separate processes agree.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Inserts a job, cancelling any active job for the same message first.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> anyhow::Result<DeliveryJob>;

    /// Claims the earliest due job, lowest attempt first, until `lease_until`.
    /// Running jobs whose lease has expired are claimable again.
    async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<DeliveryJob>>;

    /// Marks a running job completed and inserts `follow_up` in the same
    /// step. Returns `false` (and inserts nothing) when the job is no longer
    /// running, e.g. because it was superseded or cancelled meanwhile.
    async fn complete(
        &self,
        job_id: Uuid,
        follow_up: Option<NewJob>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn retry(
        &self,
        job_id: Uuid,
        next_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn discard(&self, job_id: Uuid, error: &str, now: DateTime<Utc>)
    -> anyhow::Result<bool>;

    /// Cancels the active job for a message, returning whether one existed.
    async fn cancel_active(&self, message_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn find_active(&self, message_id: Uuid) -> anyhow::Result<Option<DeliveryJob>>;

    async fn list_active_between(
        &self,
        queue: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DeliveryJob>>;
}

/// Loads a message, applies `change` and stores the result only if nobody
/// changed the status in between, reloading on contention.
///
/// `change` returns `None` when nothing should be written. The result is the
/// status seen before the change together with the stored message, if any.
pub async fn modify_message<F>(
    messages: &dyn MessageRepository,
    message_id: Uuid,
    change: F,
) -> DomainResult<(MessageStatus, Option<Message>)>
where
    F: Fn(Message) -> DomainResult<Option<Message>> + Send + Sync,
{
    for _ in 0..MODIFY_RETRIES {
        let message = messages
            .find_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound(message_id))?;
        let before = message.status();
        let Some(changed) = change(message)? else {
            return Ok((before, None));
        };
        if messages.update_if(&changed, before).await? {
            return Ok((before, Some(changed)));
        }
        debug!(%message_id, "message changed concurrently, reloading");
    }
    Err(DomainError::StorageUnavailable(anyhow::anyhow!(
        "message {message_id} kept changing concurrently"
    )))
}
