use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    application::services::sender::DeliverySender,
    domain::{
        models::{DeliveryChannel, Message, RecurrencePattern, User, message::tests::draft},
        repositories::{MessageRepository, UserRepository},
        value_objects::{DeliveryPayload, SendOutcome},
    },
};

pub(crate) async fn owner(users: &Arc<impl UserRepository>) -> User {
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        email: "ada@example.com".to_string(),
        display_name: Some("Ada".to_string()),
        push_token: None,
        email_enabled: true,
        push_enabled: true,
        created_at: now,
        updated_at: now,
    };
    users.upsert(&user).await.unwrap();
    user
}

pub(crate) async fn saved_message(
    messages: &Arc<impl MessageRepository>,
    user_id: Uuid,
    deliver_at: DateTime<Utc>,
    recurrence: RecurrencePattern,
    now: DateTime<Utc>,
) -> Message {
    let mut input = draft(user_id, deliver_at);
    input.recurrence = recurrence;
    let message = Message::new(input, now).unwrap();
    messages.insert(&message).await.unwrap();
    message
}

/// Sender that records payloads and answers from a script.
pub(crate) struct ScriptedSender {
    channel: DeliveryChannel,
    sent: Mutex<Vec<DeliveryPayload>>,
    script: Mutex<VecDeque<SendOutcome>>,
    fallback: Mutex<SendOutcome>,
}

impl ScriptedSender {
    pub(crate) fn new(channel: DeliveryChannel) -> Self {
        Self {
            channel,
            sent: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(SendOutcome::Sent),
        }
    }

    pub(crate) async fn fail_always(&self, detail: &str) {
        *self.fallback.lock().await = SendOutcome::Failed {
            detail: detail.to_string(),
        };
    }

    pub(crate) async fn fail_next(&self, times: usize, detail: &str) {
        let mut script = self.script.lock().await;
        for _ in 0..times {
            script.push_back(SendOutcome::Failed {
                detail: detail.to_string(),
            });
        }
    }

    pub(crate) async fn sent(&self) -> Vec<DeliveryPayload> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl DeliverySender for ScriptedSender {
    fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    async fn send(&self, payload: &DeliveryPayload) -> anyhow::Result<SendOutcome> {
        let outcome = match self.script.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => self.fallback.lock().await.clone(),
        };
        if outcome == SendOutcome::Sent {
            self.sent.lock().await.push(payload.clone());
        }
        Ok(outcome)
    }
}
