use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::services::sender::{DeliveryGateway, DeliverySender},
    domain::{
        errors::{DomainError, DomainResult},
        models::{AttemptOutcome, DeliveryAttempt, Message, MessageStatus, recurrence},
        repositories::{MessageRepository, UserRepository, modify_message},
        value_objects::{DeliveryPayload, Recipient, SendOutcome},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was not `scheduled`, or stopped being so while the
    /// attempt ran. Its stored state was left alone.
    Skipped { status: MessageStatus },
    /// The message is scheduled for a later instant; nothing was sent.
    NotDue { deliver_at: DateTime<Utc> },
    Delivered,
    /// A recurring message was sent and moved to its next occurrence.
    Rescheduled { next_at: DateTime<Utc> },
}

/// Runs one delivery: load, check, render, send, record the result.
pub struct DeliveryProcessor {
    messages: Arc<dyn MessageRepository>,
    users: Arc<dyn UserRepository>,
    gateway: DeliveryGateway,
}

impl DeliveryProcessor {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        users: Arc<dyn UserRepository>,
        gateway: DeliveryGateway,
    ) -> Self {
        Self {
            messages,
            users,
            gateway,
        }
    }

    /// Delivers `message_id` if it is still scheduled and due at `now`.
    ///
    /// On a failed send the message is marked `failed` and `SendFailed` is
    /// returned; whether it gets another attempt is the caller's decision.
    /// Every write is conditional on the message still being `scheduled`, so
    /// a cancel or reschedule that lands mid-send wins.
    pub async fn process(
        &self,
        message_id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<DeliveryOutcome> {
        let message = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound(message_id))?;

        let status = message.status();
        if status != MessageStatus::Scheduled {
            debug!(%message_id, %status, "message no longer scheduled, skipping");
            return Ok(DeliveryOutcome::Skipped { status });
        }
        if message.deliver_at() > now {
            debug!(%message_id, deliver_at = %message.deliver_at(), "message not due yet");
            return Ok(DeliveryOutcome::NotDue {
                deliver_at: message.deliver_at(),
            });
        }

        let (payload, sender) = match self.prepare(&message, attempt).await {
            Ok(prepared) => prepared,
            Err(DomainError::Undeliverable(reason)) => {
                let outcome = AttemptOutcome::Undeliverable;
                if let Some(status) = self
                    .record_failure(message, attempt, outcome, &reason, now)
                    .await?
                {
                    return Ok(DeliveryOutcome::Skipped { status });
                }
                return Err(DomainError::Undeliverable(reason));
            }
            Err(err) => return Err(err),
        };

        let failure = match sender.send(&payload).await {
            Ok(SendOutcome::Sent) => None,
            Ok(SendOutcome::Failed { detail }) => Some(detail),
            Err(err) => Some(format!("{err:#}")),
        };
        if let Some(detail) = failure {
            warn!(%message_id, attempt, %detail, "delivery failed");
            if let Some(status) = self
                .record_failure(message, attempt, AttemptOutcome::Failed, &detail, now)
                .await?
            {
                return Ok(DeliveryOutcome::Skipped { status });
            }
            return Err(DomainError::SendFailed(detail));
        }

        self.log_attempt(message_id, attempt, AttemptOutcome::Sent, None, now)
            .await?;

        if !message.is_recurring() {
            let delivered = message.mark_delivered(now)?;
            if let Some(status) = self.commit(&delivered).await? {
                return Ok(DeliveryOutcome::Skipped { status });
            }
            info!(%message_id, attempt, "message delivered");
            return Ok(DeliveryOutcome::Delivered);
        }

        let next_at = match recurrence::next_occurrence_after(
            message.deliver_at(),
            message.timezone(),
            message.recurrence(),
            now,
        ) {
            Ok(next_at) => next_at,
            Err(err) => {
                // The send went out; stop the series rather than leave it dangling.
                error!(%message_id, error = %err, "cannot compute next occurrence");
                let delivered = message.mark_delivered(now)?;
                self.commit(&delivered).await?;
                return Err(err);
            }
        };
        let rescheduled = message.schedule_at(next_at, now)?;
        if let Some(status) = self.commit(&rescheduled).await? {
            return Ok(DeliveryOutcome::Skipped { status });
        }
        info!(%message_id, %next_at, "recurring message delivered, next occurrence scheduled");
        Ok(DeliveryOutcome::Rescheduled { next_at })
    }

    /// Moves a `failed` message back to `scheduled` at `retry_at`.
    ///
    /// Returns `false` if the message is no longer `failed` (for instance it
    /// was cancelled while the attempt ran).
    pub async fn resurrect(
        &self,
        message_id: Uuid,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let (_, retried) = modify_message(self.messages.as_ref(), message_id, |message| {
            if message.status() != MessageStatus::Failed {
                return Ok(None);
            }
            message.schedule_at(retry_at, now).map(Some)
        })
        .await?;
        Ok(retried.is_some())
    }

    /// Stores the outcome of a run over the `scheduled` record it started
    /// from. Returns the current status when the record changed meanwhile.
    async fn commit(&self, changed: &Message) -> DomainResult<Option<MessageStatus>> {
        if self
            .messages
            .update_if(changed, MessageStatus::Scheduled)
            .await?
        {
            return Ok(None);
        }
        let message_id = changed.id();
        let current = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or(DomainError::MessageNotFound(message_id))?
            .status();
        warn!(%message_id, status = %current, "message changed during delivery, keeping its state");
        Ok(Some(current))
    }

    async fn prepare(
        &self,
        message: &Message,
        attempt: u32,
    ) -> DomainResult<(DeliveryPayload, Arc<dyn DeliverySender>)> {
        let user = self
            .users
            .find_by_id(message.user_id())
            .await?
            .ok_or_else(|| {
                DomainError::Undeliverable(format!("owner {} not found", message.user_id()))
            })?;

        let channel = message.channel();
        let address = user.delivery_address(channel).ok_or_else(|| {
            DomainError::Undeliverable(format!(
                "no {} address or channel disabled for user {}",
                channel.as_str(),
                user.id
            ))
        })?;

        let sender = self.gateway.get(channel).ok_or_else(|| {
            DomainError::Undeliverable(format!("no sender registered for {}", channel.as_str()))
        })?;

        let recipient = Recipient { channel, address };
        Ok((
            DeliveryPayload::render(message, &user, recipient, attempt),
            sender,
        ))
    }

    async fn record_failure(
        &self,
        message: Message,
        attempt: u32,
        outcome: AttemptOutcome,
        detail: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<MessageStatus>> {
        let message_id = message.id();
        self.log_attempt(message_id, attempt, outcome, Some(detail.to_string()), now)
            .await?;
        let failed = message.mark_failed(now)?;
        self.commit(&failed).await
    }

    async fn log_attempt(
        &self,
        message_id: Uuid,
        attempt: u32,
        outcome: AttemptOutcome,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.messages
            .log_attempt(DeliveryAttempt {
                id: Uuid::new_v4(),
                message_id,
                attempt_number: attempt,
                outcome,
                detail,
                created_at: now,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        domain::models::{DeliveryChannel, MessageDraft, RecurrencePattern},
        infrastructure::repositories::in_memory::{
            InMemoryMessageRepository, InMemoryUserRepository,
        },
        test_support::{ScriptedSender, owner, saved_message},
    };

    struct Fixture {
        messages: Arc<InMemoryMessageRepository>,
        users: Arc<InMemoryUserRepository>,
        sender: Arc<ScriptedSender>,
        processor: DeliveryProcessor,
    }

    fn fixture() -> Fixture {
        let messages = Arc::new(InMemoryMessageRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let sender = Arc::new(ScriptedSender::new(DeliveryChannel::Email));
        let processor = DeliveryProcessor::new(
            messages.clone(),
            users.clone(),
            DeliveryGateway::new(vec![sender.clone() as Arc<dyn DeliverySender>]),
        );
        Fixture {
            messages,
            users,
            sender,
            processor,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 10, 7, 0, 0).unwrap()
    }

    async fn one_shot(f: &Fixture, user_id: Uuid) -> Message {
        let at = t0() + Duration::hours(1);
        saved_message(&f.messages, user_id, at, RecurrencePattern::None, t0()).await
    }

    #[tokio::test]
    async fn delivers_one_shot_message() {
        let f = fixture();
        let user = owner(&f.users).await;
        let message = one_shot(&f, user.id).await;

        let at = t0() + Duration::hours(1);
        let outcome = f.processor.process(message.id(), 1, at).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        let stored = f.messages.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Delivered);
        assert_eq!(stored.delivered_at(), Some(at));
        let sent = f.sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient.address, user.email);
        assert!(sent[0].body.starts_with("Hi Ada,"));
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let f = fixture();
        let user = owner(&f.users).await;
        let message = one_shot(&f, user.id).await;
        let at = t0() + Duration::hours(1);

        f.processor.process(message.id(), 1, at).await.unwrap();
        let again = f.processor.process(message.id(), 1, at).await.unwrap();

        assert_eq!(
            again,
            DeliveryOutcome::Skipped {
                status: MessageStatus::Delivered
            }
        );
        assert_eq!(f.sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn daily_message_moves_to_same_local_hour_next_day() {
        let f = fixture();
        let user = owner(&f.users).await;
        let deliver_at = t0() + Duration::hours(1);
        let message = saved_message(
            &f.messages,
            user.id,
            deliver_at,
            RecurrencePattern::Daily,
            t0(),
        )
        .await;

        let outcome = f.processor.process(message.id(), 1, deliver_at).await.unwrap();

        let next_at = t0() + Duration::hours(25);
        assert_eq!(outcome, DeliveryOutcome::Rescheduled { next_at });
        let stored = f.messages.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Scheduled);
        assert_eq!(stored.deliver_at(), next_at);
        assert_eq!(stored.delivered_at(), None);
    }

    #[tokio::test]
    async fn failed_send_marks_message_failed() {
        let f = fixture();
        let user = owner(&f.users).await;
        let message = one_shot(&f, user.id).await;
        f.sender.fail_always("mailbox full").await;

        let err = f
            .processor
            .process(message.id(), 1, t0() + Duration::hours(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::SendFailed(ref d) if d == "mailbox full"));
        let stored = f.messages.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Failed);
        let attempts = f.messages.list_attempts(message.id()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
    }

    #[tokio::test]
    async fn disabled_channel_is_undeliverable() {
        let f = fixture();
        let mut user = owner(&f.users).await;
        user.email_enabled = false;
        f.users.upsert(&user).await.unwrap();
        let message = one_shot(&f, user.id).await;

        let err = f
            .processor
            .process(message.id(), 1, t0() + Duration::hours(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::Undeliverable(_)));
        assert!(f.sender.sent().await.is_empty());
        let stored = f.messages.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Failed);
    }

    #[tokio::test]
    async fn missing_sender_is_undeliverable() {
        let f = fixture();
        let mut user = owner(&f.users).await;
        user.push_token = Some("device-token".into());
        f.users.upsert(&user).await.unwrap();
        let mut draft: MessageDraft =
            crate::domain::models::message::tests::draft(user.id, t0() + Duration::hours(1));
        draft.channel = DeliveryChannel::Push;
        let message = Message::new(draft, t0()).unwrap();
        f.messages.insert(&message).await.unwrap();

        let err = f
            .processor
            .process(message.id(), 1, t0() + Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Undeliverable(_)));
    }

    #[tokio::test]
    async fn unknown_message_is_not_found() {
        let f = fixture();
        let id = Uuid::new_v4();
        let err = f.processor.process(id, 1, t0()).await.unwrap_err();
        assert!(matches!(err, DomainError::MessageNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn resurrect_only_touches_failed_messages() {
        let f = fixture();
        let user = owner(&f.users).await;
        let message = one_shot(&f, user.id).await;
        assert!(!f.processor.resurrect(message.id(), t0(), t0()).await.unwrap());

        f.sender.fail_always("timeout").await;
        let _ = f.processor.process(message.id(), 1, t0() + Duration::hours(1)).await;
        let retry_at = t0() + Duration::hours(2);
        assert!(f.processor.resurrect(message.id(), retry_at, t0()).await.unwrap());

        let stored = f.messages.find_by_id(message.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Scheduled);
        assert_eq!(stored.deliver_at(), retry_at);
    }

    #[tokio::test]
    async fn early_run_reports_not_due_without_sending() {
        let f = fixture();
        let user = owner(&f.users).await;
        let message = one_shot(&f, user.id).await;

        let outcome = f.processor.process(message.id(), 1, t0()).await.unwrap();

        assert_eq!(
            outcome,
            DeliveryOutcome::NotDue {
                deliver_at: message.deliver_at()
            }
        );
        assert!(f.sender.sent().await.is_empty());
        assert!(f.messages.list_attempts(message.id()).await.unwrap().is_empty());
    }

    /// Cancels the message it is asked to deliver before answering.
    struct CancellingSender {
        messages: Arc<InMemoryMessageRepository>,
    }

    #[async_trait::async_trait]
    impl DeliverySender for CancellingSender {
        fn channel(&self) -> DeliveryChannel {
            DeliveryChannel::Email
        }

        async fn send(&self, payload: &DeliveryPayload) -> anyhow::Result<SendOutcome> {
            let message = self.messages.find_by_id(payload.message_id).await?;
            let message = message.ok_or_else(|| anyhow::anyhow!("message vanished"))?;
            let cancelled = message.cancel(Utc::now())?;
            self.messages
                .update_if(&cancelled, MessageStatus::Scheduled)
                .await?;
            Ok(SendOutcome::Sent)
        }
    }

    #[tokio::test]
    async fn cancel_during_send_is_not_overwritten() {
        let messages = Arc::new(InMemoryMessageRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let sender = Arc::new(CancellingSender {
            messages: messages.clone(),
        });
        let processor = DeliveryProcessor::new(
            messages.clone(),
            users.clone(),
            DeliveryGateway::new(vec![sender as Arc<dyn DeliverySender>]),
        );
        let user = owner(&users).await;
        let deliver_at = t0() + Duration::hours(1);
        let daily =
            saved_message(&messages, user.id, deliver_at, RecurrencePattern::Daily, t0()).await;

        let outcome = processor.process(daily.id(), 1, deliver_at).await.unwrap();

        assert_eq!(
            outcome,
            DeliveryOutcome::Skipped {
                status: MessageStatus::Cancelled
            }
        );
        let stored = messages.find_by_id(daily.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Cancelled);
        assert_eq!(stored.deliver_at(), deliver_at);
        let attempts = messages.list_attempts(daily.id()).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Sent);
    }
}
