use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    models::{DeliveryAttempt, DeliveryJob, JobState, Message, MessageStatus, NewJob, User},
    repositories::{JobQueue, MessageRepository, UserRepository},
};

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }

    async fn upsert(&self, user: &User) -> anyhow::Result<()> {
        let mut users = self.users.write().await;
        users.insert(user.id, user.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: Arc<RwLock<HashMap<Uuid, Message>>>,
    attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn insert(&self, message: &Message) -> anyhow::Result<()> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id()) {
            anyhow::bail!("message {} already exists", message.id());
        }
        messages.insert(message.id(), message.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Message>> {
        let messages = self.messages.read().await;
        Ok(messages.get(&id).cloned())
    }

    async fn update_if(&self, message: &Message, expected: MessageStatus) -> anyhow::Result<bool> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&message.id()) {
            Some(entry) if entry.status() == expected => {
                *entry = message.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("message {} does not exist", message.id()),
        }
    }

    async fn find_due_before(
        &self,
        instant: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut due: Vec<Message> = messages
            .values()
            .filter(|m| m.status() == MessageStatus::Scheduled && m.deliver_at() <= instant)
            .cloned()
            .collect();
        due.sort_by_key(|m| m.deliver_at());
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn find_by_status(
        &self,
        status: MessageStatus,
        limit: u32,
    ) -> anyhow::Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut found: Vec<Message> = messages
            .values()
            .filter(|m| m.status() == status)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.deliver_at());
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn find_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Message>> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .filter(|m| {
                m.status() == MessageStatus::Scheduled
                    && m.deliver_at() >= from
                    && m.deliver_at() < to
            })
            .cloned()
            .collect())
    }

    async fn log_attempt(&self, attempt: DeliveryAttempt) -> anyhow::Result<()> {
        let mut attempts = self.attempts.write().await;
        attempts.push(attempt);
        Ok(())
    }

    async fn list_attempts(&self, message_id: Uuid) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .iter()
            .rev()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect())
    }
}

/// Job table held in process memory.
///
/// Every operation runs under a single write lock, which makes the
/// supersede-then-insert in [`JobQueue::enqueue`] atomic.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Arc<RwLock<HashMap<Uuid, DeliveryJob>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job ever recorded for `message_id`, oldest first.
    pub async fn history(&self, message_id: Uuid) -> Vec<DeliveryJob> {
        let jobs = self.jobs.read().await;
        let mut history: Vec<DeliveryJob> = jobs
            .values()
            .filter(|j| j.message_id == message_id)
            .cloned()
            .collect();
        history.sort_by_key(|j| j.created_at);
        history
    }

    fn insert_unique(
        jobs: &mut HashMap<Uuid, DeliveryJob>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DeliveryJob> {
        if jobs
            .values()
            .any(|j| j.message_id == job.message_id && j.state.is_active())
        {
            anyhow::bail!("an active job already exists for message {}", job.message_id);
        }
        let job = job.into_job(now);
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn transition_running(
        jobs: &mut HashMap<Uuid, DeliveryJob>,
        job_id: Uuid,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut DeliveryJob),
    ) -> bool {
        match jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Running => {
                apply(job);
                job.leased_until = None;
                job.updated_at = now;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> anyhow::Result<DeliveryJob> {
        let mut jobs = self.jobs.write().await;
        for existing in jobs.values_mut() {
            if existing.message_id == job.message_id && existing.state.is_active() {
                existing.state = JobState::Cancelled;
                existing.leased_until = None;
                existing.updated_at = now;
            }
        }
        Self::insert_unique(&mut jobs, job, now)
    }

    async fn lease(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<DeliveryJob>> {
        let mut jobs = self.jobs.write().await;
        let next = jobs
            .values_mut()
            .filter(|j| j.queue == queue && j.scheduled_at <= now)
            .filter(|j| match j.state {
                JobState::Available | JobState::Retryable => true,
                JobState::Running => j.leased_until.is_some_and(|until| until < now),
                _ => false,
            })
            .min_by_key(|j| (j.scheduled_at, j.attempt));

        Ok(next.map(|job| {
            job.state = JobState::Running;
            job.leased_until = Some(lease_until);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        follow_up: Option<NewJob>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.write().await;
        if !Self::transition_running(&mut jobs, job_id, now, |job| {
            job.state = JobState::Completed;
        }) {
            return Ok(false);
        }
        if let Some(follow_up) = follow_up {
            Self::insert_unique(&mut jobs, follow_up, now)?;
        }
        Ok(true)
    }

    async fn retry(
        &self,
        job_id: Uuid,
        next_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.write().await;
        Ok(Self::transition_running(&mut jobs, job_id, now, |job| {
            job.state = JobState::Retryable;
            job.attempt += 1;
            job.scheduled_at = next_at;
            job.last_error = Some(error.to_string());
        }))
    }

    async fn discard(
        &self,
        job_id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.write().await;
        Ok(Self::transition_running(&mut jobs, job_id, now, |job| {
            job.state = JobState::Discarded;
            job.last_error = Some(error.to_string());
        }))
    }

    async fn cancel_active(&self, message_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.write().await;
        let mut cancelled = false;
        for job in jobs.values_mut() {
            if job.message_id == message_id && job.state.is_active() {
                job.state = JobState::Cancelled;
                job.leased_until = None;
                job.updated_at = now;
                cancelled = true;
            }
        }
        Ok(cancelled)
    }

    async fn find_active(&self, message_id: Uuid) -> anyhow::Result<Option<DeliveryJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .find(|j| j.message_id == message_id && j.state.is_active())
            .cloned())
    }

    async fn list_active_between(
        &self,
        queue: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DeliveryJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.state.is_active()
                    && j.scheduled_at >= from
                    && j.scheduled_at < to
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        domain::models::RecurrencePattern,
        test_support::{owner, saved_message},
    };

    fn new_job(message_id: Uuid, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            message_id,
            queue: "default".into(),
            scheduled_at,
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn enqueue_twice_leaves_one_active_job() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        let message_id = Uuid::new_v4();

        queue.enqueue(new_job(message_id, now), now).await.unwrap();
        let second = queue.enqueue(new_job(message_id, now), now).await.unwrap();

        let history = queue.history(message_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|j| j.state.is_active()).count(), 1);
        assert_eq!(queue.find_active(message_id).await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn lease_skips_future_jobs_and_prefers_earliest() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        let late = Uuid::new_v4();
        let early = Uuid::new_v4();
        let future = Uuid::new_v4();
        queue.enqueue(new_job(late, now - Duration::minutes(1)), now).await.unwrap();
        queue.enqueue(new_job(early, now - Duration::minutes(5)), now).await.unwrap();
        queue.enqueue(new_job(future, now + Duration::minutes(5)), now).await.unwrap();

        let lease_until = now + Duration::minutes(5);
        let first = queue.lease("default", now, lease_until).await.unwrap().unwrap();
        assert_eq!(first.message_id, early);
        assert_eq!(first.state, JobState::Running);
        let second = queue.lease("default", now, lease_until).await.unwrap().unwrap();
        assert_eq!(second.message_id, late);
        assert!(queue.lease("default", now, lease_until).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        let message_id = Uuid::new_v4();
        queue.enqueue(new_job(message_id, now), now).await.unwrap();

        let leased = queue
            .lease("default", now, now + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        let still_leased = now + Duration::seconds(10);
        assert!(
            queue
                .lease("default", still_leased, still_leased + Duration::seconds(30))
                .await
                .unwrap()
                .is_none()
        );

        let expired = now + Duration::seconds(31);
        let reclaimed = queue
            .lease("default", expired, expired + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, leased.id);
    }

    #[tokio::test]
    async fn complete_of_superseded_job_inserts_nothing() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        let message_id = Uuid::new_v4();
        queue.enqueue(new_job(message_id, now), now).await.unwrap();
        let leased = queue
            .lease("default", now, now + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();

        let replacement = queue
            .enqueue(new_job(message_id, now + Duration::hours(1)), now)
            .await
            .unwrap();
        let completed = queue
            .complete(leased.id, Some(new_job(message_id, now + Duration::days(1))), now)
            .await
            .unwrap();

        assert!(!completed);
        let active = queue.find_active(message_id).await.unwrap().unwrap();
        assert_eq!(active.id, replacement.id);
    }

    #[tokio::test]
    async fn cancel_reports_whether_a_job_existed() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        let message_id = Uuid::new_v4();
        assert!(!queue.cancel_active(message_id, now).await.unwrap());
        queue.enqueue(new_job(message_id, now), now).await.unwrap();
        assert!(queue.cancel_active(message_id, now).await.unwrap());
        assert!(queue.find_active(message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_if_only_writes_over_expected_status() {
        let messages = Arc::new(InMemoryMessageRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let user = owner(&users).await;
        let now = Utc::now();
        let at = now + Duration::hours(1);
        let message = saved_message(&messages, user.id, at, RecurrencePattern::None, now).await;

        let cancelled = message.clone().cancel(now).unwrap();
        assert!(
            messages
                .update_if(&cancelled, MessageStatus::Scheduled)
                .await
                .unwrap()
        );
        let delivered = message.mark_delivered(now).unwrap();
        assert!(
            !messages
                .update_if(&delivered, MessageStatus::Scheduled)
                .await
                .unwrap()
        );

        let stored = messages.find_by_id(cancelled.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn find_by_status_orders_by_delivery_time_and_limits() {
        let messages = Arc::new(InMemoryMessageRepository::new());
        let users = Arc::new(InMemoryUserRepository::new());
        let user = owner(&users).await;
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for hours in [5, 2, 9] {
            let at = now + Duration::hours(hours);
            let message = saved_message(&messages, user.id, at, RecurrencePattern::None, now).await;
            let message = message.cancel(now).unwrap();
            messages
                .update_if(&message, MessageStatus::Scheduled)
                .await
                .unwrap();
            cancelled.push(message);
        }
        let at = now + Duration::hours(1);
        saved_message(&messages, user.id, at, RecurrencePattern::None, now).await;

        let found = messages
            .find_by_status(MessageStatus::Cancelled, 2)
            .await
            .unwrap();

        let ids: Vec<_> = found.iter().map(|message| message.id()).collect();
        assert_eq!(ids, vec![cancelled[1].id(), cancelled[0].id()]);
        let failed = messages.find_by_status(MessageStatus::Failed, 10).await.unwrap();
        assert!(failed.is_empty());
    }
}
