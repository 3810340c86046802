use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        handlers::delivery_processor::{DeliveryOutcome, DeliveryProcessor},
        services::scheduler::{
            BackoffPolicy, ScheduleHandle, ScheduledMessage, Scheduler, Tracking,
        },
    },
    domain::{
        errors::{DomainError, DomainResult},
        models::{DeliveryJob, MessageStatus, NewJob},
        repositories::{JobQueue, MessageRepository, modify_message},
    },
};

#[derive(Debug, Clone)]
pub struct QueueSchedulerConfig {
    pub queue: String,
    pub workers: usize,
    /// Idle wait between lease attempts when nothing is due.
    pub poll_interval: Duration,
    /// How long a leased job stays claimed before another worker may take it.
    pub lease_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for QueueSchedulerConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            workers: 10,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Scheduler backed by a durable job table and a pool of lease-based workers.
pub struct QueueScheduler {
    shared: Arc<Shared>,
    pool: Mutex<Option<WorkerPool>>,
}

struct Shared {
    messages: Arc<dyn MessageRepository>,
    jobs: Arc<dyn JobQueue>,
    processor: Arc<DeliveryProcessor>,
    config: QueueSchedulerConfig,
}

struct WorkerPool {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl QueueScheduler {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        jobs: Arc<dyn JobQueue>,
        processor: Arc<DeliveryProcessor>,
        config: QueueSchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                messages,
                jobs,
                processor,
                config,
            }),
            pool: Mutex::new(None),
        }
    }

    /// Leases and runs at most one due job. Returns whether a job was found.
    pub async fn run_once(&self, worker_id: usize, now: DateTime<Utc>) -> DomainResult<bool> {
        self.shared.run_once(worker_id, now).await
    }

    fn new_job(&self, message_id: Uuid, scheduled_at: DateTime<Utc>) -> NewJob {
        self.shared.new_job(message_id, scheduled_at)
    }
}

impl Shared {
    fn new_job(&self, message_id: Uuid, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            message_id,
            queue: self.config.queue.clone(),
            scheduled_at,
            max_attempts: self.config.backoff.max_attempts,
        }
    }

    async fn run_once(&self, worker_id: usize, now: DateTime<Utc>) -> DomainResult<bool> {
        let lease_until = now
            + chrono::Duration::from_std(self.config.lease_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let Some(job) = self.jobs.lease(&self.config.queue, now, lease_until).await? else {
            return Ok(false);
        };

        debug!(
            worker_id,
            job_id = %job.id,
            message_id = %job.message_id,
            attempt = job.attempt,
            "job leased"
        );

        match self.processor.process(job.message_id, job.attempt + 1, now).await {
            Ok(DeliveryOutcome::Rescheduled { next_at }) => {
                let follow_up = self.new_job(job.message_id, next_at);
                if !self.jobs.complete(job.id, Some(follow_up), now).await? {
                    debug!(job_id = %job.id, "job superseded while running, follow-up skipped");
                }
            }
            Ok(DeliveryOutcome::NotDue { deliver_at }) => {
                // A reclaimed lease whose message already moved on.
                let follow_up = self.new_job(job.message_id, deliver_at);
                self.jobs.complete(job.id, Some(follow_up), now).await?;
                debug!(job_id = %job.id, %deliver_at, "message not due, job re-armed");
            }
            Ok(outcome) => {
                self.jobs.complete(job.id, None, now).await?;
                debug!(job_id = %job.id, ?outcome, "job completed");
            }
            Err(err) => self.handle_failure(&job, err, now).await?,
        }
        Ok(true)
    }

    async fn handle_failure(
        &self,
        job: &DeliveryJob,
        err: DomainError,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let reason = err.to_string();
        let backoff = &self.config.backoff;

        if err.is_retryable() && backoff.should_retry(job.attempt) {
            let retry = job.attempt + 1;
            let retry_at = backoff.retry_at(now, retry);
            if !self.jobs.retry(job.id, retry_at, &reason, now).await? {
                return Ok(());
            }
            self.processor
                .resurrect(job.message_id, retry_at, now)
                .await?;
            warn!(
                job_id = %job.id,
                message_id = %job.message_id,
                retry,
                %retry_at,
                error = %reason,
                "delivery failed, retry scheduled"
            );
            return Ok(());
        }

        if !self.jobs.discard(job.id, &reason, now).await? {
            return Ok(());
        }
        if err.is_retryable() {
            let report = exhausted(job);
            error!(job_id = %job.id, error = %report, last_error = %reason, "job discarded");
        } else {
            let message_id = job.message_id;
            error!(job_id = %job.id, %message_id, error = %reason, "job discarded");
        }
        self.leave_failed(job.message_id, now).await
    }

    /// A discarded job must not leave its message looking scheduled.
    async fn leave_failed(&self, message_id: Uuid, now: DateTime<Utc>) -> DomainResult<()> {
        let result = modify_message(self.messages.as_ref(), message_id, |message| {
            if !message.status().can_transition_to(MessageStatus::Failed) {
                return Ok(None);
            }
            message.mark_failed(now).map(Some)
        })
        .await;
        match result {
            Ok(_) | Err(DomainError::MessageNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, token: CancellationToken) {
        info!(worker_id, queue = %self.config.queue, "delivery worker started");
        loop {
            if token.is_cancelled() {
                break;
            }

            let idle = match self.run_once(worker_id, Utc::now()).await {
                Ok(processed) => !processed,
                Err(err) => {
                    warn!(worker_id, error = %err, "worker cycle failed, backing off");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
        info!(worker_id, "delivery worker stopped");
    }
}

/// `job.attempt` counts failures before this run, so the run that exhausted
/// the job is one more.
fn exhausted(job: &DeliveryJob) -> DomainError {
    DomainError::AttemptsExhausted {
        message_id: job.message_id,
        attempts: job.attempt + 1,
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    async fn schedule(
        &self,
        message_id: Uuid,
        deliver_at: DateTime<Utc>,
    ) -> DomainResult<ScheduleHandle> {
        let now = Utc::now();
        modify_message(self.shared.messages.as_ref(), message_id, |message| {
            message.schedule_at(deliver_at, now).map(Some)
        })
        .await?;
        let job = self
            .shared
            .jobs
            .enqueue(self.new_job(message_id, deliver_at), now)
            .await?;

        info!(%message_id, job_id = %job.id, %deliver_at, "message scheduled");
        Ok(ScheduleHandle {
            message_id,
            deliver_at,
            tracking: Tracking::Queue {
                job_id: job.id,
                queue: job.queue,
            },
        })
    }

    async fn cancel(&self, message_id: Uuid) -> DomainResult<bool> {
        let now = Utc::now();
        let (status, cancelled) =
            modify_message(self.shared.messages.as_ref(), message_id, |message| {
                if message.status().is_terminal() {
                    return Ok(None);
                }
                message.cancel(now).map(Some)
            })
            .await?;
        if cancelled.is_none() {
            debug!(%message_id, %status, "cancel ignored for terminal message");
            return Ok(false);
        }

        let had_job = self.shared.jobs.cancel_active(message_id, now).await?;
        info!(%message_id, had_job, "message cancelled");
        Ok(had_job)
    }

    async fn list_scheduled(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<ScheduledMessage>> {
        let jobs = self
            .shared
            .jobs
            .list_active_between(&self.shared.config.queue, from, to)
            .await?;
        Ok(jobs
            .into_iter()
            .map(|job| ScheduledMessage {
                message_id: job.message_id,
                deliver_at: job.scheduled_at,
                attempt: job.attempt,
                job_state: Some(job.state),
            })
            .collect())
    }

    async fn start(&self) -> DomainResult<()> {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            return Ok(());
        }

        let workers = self.shared.config.workers.max(1);
        info!(
            workers,
            queue = %self.shared.config.queue,
            poll_interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            "starting queue scheduler"
        );

        let token = CancellationToken::new();
        let handles = (0..workers)
            .map(|worker_id| {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(shared.worker_loop(worker_id, token.child_token()))
            })
            .collect();
        *pool = Some(WorkerPool { token, handles });
        Ok(())
    }

    async fn shutdown(&self) -> DomainResult<()> {
        let Some(mut pool) = self.pool.lock().await.take() else {
            return Ok(());
        };
        info!("stopping queue scheduler");
        pool.token.cancel();

        let grace = self.shared.config.shutdown_timeout;
        let finished = tokio::time::timeout(
            grace,
            futures::future::join_all(pool.handles.iter_mut()),
        )
        .await;

        if finished.is_err() {
            // Leases of abandoned jobs expire and other workers pick them up.
            warn!(
                grace_ms = grace.as_millis() as u64,
                "workers did not stop in time, aborting"
            );
            for handle in &pool.handles {
                handle.abort();
            }
        }
        Ok(())
    }
}
