use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    Failed,
    Undeliverable,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Sent => "sent",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Undeliverable => "undeliverable",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(AttemptOutcome::Sent),
            "failed" => Some(AttemptOutcome::Failed),
            "undeliverable" => Some(AttemptOutcome::Undeliverable),
            _ => None,
        }
    }
}

/// One row of a message's delivery history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub message_id: Uuid,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}
