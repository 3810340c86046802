use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        handlers::delivery_processor::DeliveryProcessor,
        services::scheduler::{ScheduleHandle, ScheduledMessage, Scheduler, Tracking},
    },
    domain::{
        errors::DomainResult,
        models::MessageStatus,
        repositories::{MessageRepository, modify_message},
    },
};

#[derive(Clone, Debug)]
pub struct PollingConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub max_concurrent: usize,
    pub shutdown_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_concurrent: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Scheduler that keeps no intent of its own: the message's `deliver_at`
/// is the schedule, and a ticker sweeps for due messages.
pub struct PollingScheduler {
    task: Arc<PollingTask>,
    runtime: Mutex<Option<PollerHandle>>,
}

struct PollingTask {
    messages: Arc<dyn MessageRepository>,
    processor: Arc<DeliveryProcessor>,
    config: PollingConfig,
}

struct PollerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollingScheduler {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        processor: Arc<DeliveryProcessor>,
        config: PollingConfig,
    ) -> Self {
        Self {
            task: Arc::new(PollingTask {
                messages,
                processor,
                config,
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Runs one sweep over messages due at `now`. Returns how many were picked up.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        self.task.poll_once(now).await
    }
}

impl PollingTask {
    async fn poll_once(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let due = self
            .messages
            .find_due_before(now, self.config.batch_size.max(1))
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let count = due.len();
        debug!(count, "dispatching due messages");

        let processor = &self.processor;
        futures::stream::iter(due)
            .for_each_concurrent(self.config.max_concurrent.max(1), |message| async move {
                let message_id = message.id();
                match processor.process(message_id, 1, now).await {
                    Ok(outcome) => debug!(%message_id, ?outcome, "poll delivery finished"),
                    Err(err) => warn!(%message_id, error = %err, "poll delivery failed"),
                }
            })
            .await;

        Ok(count)
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "starting polling scheduler"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(Utc::now()).await {
                        error!(error = %err, "polling cycle failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("polling scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Scheduler for PollingScheduler {
    async fn schedule(
        &self,
        message_id: Uuid,
        deliver_at: DateTime<Utc>,
    ) -> DomainResult<ScheduleHandle> {
        let now = Utc::now();
        modify_message(self.task.messages.as_ref(), message_id, |message| {
            message.schedule_at(deliver_at, now).map(Some)
        })
        .await?;

        info!(%message_id, %deliver_at, "message scheduled for polling");
        Ok(ScheduleHandle {
            message_id,
            deliver_at,
            tracking: Tracking::Polling {
                interval_ms: self.task.config.poll_interval.as_millis() as u64,
            },
        })
    }

    async fn cancel(&self, message_id: Uuid) -> DomainResult<bool> {
        let now = Utc::now();
        let (status, cancelled) =
            modify_message(self.task.messages.as_ref(), message_id, |message| {
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

        info!(%message_id, "message cancelled");
        Ok(status == MessageStatus::Scheduled)
    }

    async fn list_scheduled(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DomainResult<Vec<ScheduledMessage>> {
        let messages = self.task.messages.find_scheduled_between(from, to).await?;
        Ok(messages
            .into_iter()
            .map(|message| ScheduledMessage {
                message_id: message.id(),
                deliver_at: message.deliver_at(),
                attempt: 0,
                job_state: None,
            })
            .collect())
    }

    async fn start(&self) -> DomainResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.task).run(shutdown_rx));
        *runtime = Some(PollerHandle {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    async fn shutdown(&self) -> DomainResult<()> {
        let Some(mut poller) = self.runtime.lock().await.take() else {
            return Ok(());
        };
        let _ = poller.shutdown_tx.send(true);

        let grace = self.task.config.shutdown_timeout;
        match tokio::time::timeout(grace, &mut poller.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "polling task panicked"),
            Err(_) => {
                let grace_ms = grace.as_millis() as u64;
                warn!(grace_ms, "polling task did not stop in time, aborting");
                poller.handle.abort();
            }
        }
        Ok(())
    }
}
