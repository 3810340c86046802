use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::DeliveryChannel;

/// Message owner along with the delivery preferences the scheduler needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub push_token: Option<String>,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Where to deliver on `channel`, or `None` if the user opted out or has
    /// no address for it.
    pub fn delivery_address(&self, channel: DeliveryChannel) -> Option<String> {
        match channel {
            DeliveryChannel::Email if self.email_enabled && !self.email.trim().is_empty() => {
                Some(self.email.clone())
            }
            DeliveryChannel::Push if self.push_enabled => self.push_token.clone(),
            _ => None,
        }
    }
}
