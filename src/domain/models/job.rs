use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
}

impl JobState {
    pub const ACTIVE: [JobState; 3] = [JobState::Available, JobState::Retryable, JobState::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "available" => Some(JobState::Available),
            "running" => Some(JobState::Running),
            "retryable" => Some(JobState::Retryable),
            "completed" => Some(JobState::Completed),
            "discarded" => Some(JobState::Discarded),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// Active jobs count against the one-job-per-message uniqueness rule.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

/// A persisted intent to run one delivery for a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub message_id: Uuid,
    pub queue: String,
    pub scheduled_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub message_id: Uuid,
    pub queue: String,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> DeliveryJob {
        DeliveryJob {
            id: Uuid::new_v4(),
            message_id: self.message_id,
            queue: self.queue,
            scheduled_at: self.scheduled_at,
            attempt: 0,
            max_attempts: self.max_attempts,
            state: JobState::Available,
            leased_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
