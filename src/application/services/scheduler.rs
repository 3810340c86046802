use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{errors::DomainResult, models::JobState};

/// How a scheduled delivery is being tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tracking {
    Queue { job_id: Uuid, queue: String },
    Polling { interval_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleHandle {
    pub message_id: Uuid,
    pub deliver_at: DateTime<Utc>,
    pub tracking: Tracking,
}

/// Read-only view of a pending delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub message_id: Uuid,
    pub deliver_at: DateTime<Utc>,
    pub attempt: u32,
    pub job_state: Option<JobState>,
}

/// Delivery intent management, shared by the queue-backed and polling
/// implementations.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// (Re)establishes delivery of `message_id` at `deliver_at`, superseding
    /// any pending intent, and syncs the stored message to `scheduled`.
    async fn schedule(
        &self,
        message_id: Uuid,
        deliver_at: DateTime<Utc>,
    ) -> DomainResult<ScheduleHandle>;

    /// Cancels the message and drops its pending intent. Returns whether a
    /// pending intent existed; terminal messages are left untouched.
    async fn cancel(&self, message_id: Uuid) -> DomainResult<bool>;

    async fn reschedule(
        &self,
        message_id: Uuid,
        deliver_at: DateTime<Utc>,
    ) -> DomainResult<ScheduleHandle> {
        self.schedule(message_id, deliver_at).await
    }

    /// Pending deliveries with `from <= deliver_at < to`, in no particular order.
    async fn list_scheduled(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<ScheduledMessage>>;

    /// Spawns the background workers. Calling it twice is a no-op.
    async fn start(&self) -> DomainResult<()>;

    /// Stops the workers, letting in-flight deliveries finish within the
    /// configured grace period.
    async fn shutdown(&self) -> DomainResult<()>;
}

/// Geometric retry delays: `base * factor^(n-1)` for the n-th retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_delay: Option<Duration>,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    /// 5, 15, 45, 135 and 405 minutes.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5 * 60),
            factor: 3,
            max_delay: None,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Whether a job that has already failed `failed_attempts` times may be
    /// retried once more.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Delay before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(multiplier)
            .unwrap_or(Duration::from_secs(u64::from(u32::MAX)));
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn retry_at(&self, now: DateTime<Utc>, retry: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
