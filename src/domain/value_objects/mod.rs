use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::{DeliveryChannel, Message, User};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub channel: DeliveryChannel,
    pub address: String,
}

/// Everything a sender needs to transmit one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
    pub attempt: u32,
    pub scheduled_for: DateTime<Utc>,
}

impl DeliveryPayload {
    pub fn render(message: &Message, user: &User, recipient: Recipient, attempt: u32) -> Self {
        let body = match user.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("Hi {name},\n\n{}", message.body()),
            _ => message.body().to_string(),
        };
        Self {
            message_id: message.id(),
            user_id: message.user_id(),
            recipient,
            subject: message.title().to_string(),
            body,
            attempt,
            scheduled_for: message.deliver_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed { detail: String },
}
