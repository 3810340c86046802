pub mod polling;
pub mod queue;

use std::sync::Arc;

use tracing::{info, warn};

pub use polling::{PollingConfig, PollingScheduler};
pub use queue::{QueueScheduler, QueueSchedulerConfig};

use crate::{
    application::{handlers::delivery_processor::DeliveryProcessor, services::scheduler::Scheduler},
    domain::repositories::{JobQueue, MessageRepository},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    #[default]
    Queue,
    Polling,
}

impl SchedulerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerMode::Queue => "queue",
            SchedulerMode::Polling => "polling",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queue" => Some(SchedulerMode::Queue),
            "polling" => Some(SchedulerMode::Polling),
            _ => None,
        }
    }
}

/// Picks the scheduler for `mode`. Queue mode without a job store degrades
/// to polling.
pub fn build_scheduler(
    mode: SchedulerMode,
    messages: Arc<dyn MessageRepository>,
    jobs: Option<Arc<dyn JobQueue>>,
    processor: Arc<DeliveryProcessor>,
    queue_config: QueueSchedulerConfig,
    polling_config: PollingConfig,
) -> Arc<dyn Scheduler> {
    match (mode, jobs) {
        (SchedulerMode::Queue, Some(jobs)) => {
            info!(
                queue = %queue_config.queue,
                workers = queue_config.workers,
                "using queue scheduler"
            );
            Arc::new(QueueScheduler::new(messages, jobs, processor, queue_config))
        }
        (SchedulerMode::Queue, None) => {
            warn!("job queue unavailable, falling back to polling scheduler");
            Arc::new(PollingScheduler::new(messages, processor, polling_config))
        }
        (SchedulerMode::Polling, _) => {
            info!("using polling scheduler");
            Arc::new(PollingScheduler::new(messages, processor, polling_config))
        }
    }
}
