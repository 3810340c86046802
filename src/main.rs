use std::sync::Arc;

use message_scheduler::{
    application::{
        handlers::delivery_processor::DeliveryProcessor,
        services::sender::{DeliveryGateway, DeliverySender},
    },
    config::Config,
    domain::{
        models::DeliveryChannel,
        repositories::{JobQueue, MessageRepository, UserRepository},
    },
    infrastructure::{
        delivery::{HttpRelaySender, LogSender},
        repositories::{
            in_memory::{InMemoryJobQueue, InMemoryMessageRepository, InMemoryUserRepository},
            postgres::{self, PostgresJobQueue, PostgresMessageRepository, PostgresUserRepository},
        },
        scheduling::build_scheduler,
    },
};
use tokio::main;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DB_MAX_CONNECTIONS: u32 = 20;

struct Stores {
    users: Arc<dyn UserRepository>,
    messages: Arc<dyn MessageRepository>,
    jobs: Option<Arc<dyn JobQueue>>,
}

#[main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::try_parse()?;
    info!(mode = config.mode.as_str(), "starting message scheduler");

    let stores = open_stores(&config).await?;
    let gateway = build_gateway(&config)?;
    let processor = Arc::new(DeliveryProcessor::new(
        stores.messages.clone(),
        stores.users.clone(),
        gateway,
    ));

    let scheduler = build_scheduler(
        config.mode,
        stores.messages,
        stores.jobs,
        processor,
        config.queue.clone(),
        config.polling.clone(),
    );
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    scheduler.shutdown().await?;
    info!("message scheduler stopped");
    Ok(())
}

async fn open_stores(config: &Config) -> anyhow::Result<Stores> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, using in-memory stores");
        return Ok(Stores {
            users: Arc::new(InMemoryUserRepository::new()),
            messages: Arc::new(InMemoryMessageRepository::new()),
            jobs: Some(Arc::new(InMemoryJobQueue::new())),
        });
    };

    let pool = postgres::connect(url, DB_MAX_CONNECTIONS).await?;
    let jobs: Arc<dyn JobQueue> = PostgresJobQueue::new(pool.clone());
    let jobs = match jobs.find_active(Uuid::nil()).await {
        Ok(_) => Some(jobs),
        Err(err) => {
            warn!(error = %err, "job table not usable");
            None
        }
    };

    Ok(Stores {
        users: PostgresUserRepository::new(pool.clone()),
        messages: PostgresMessageRepository::new(pool),
        jobs,
    })
}

fn build_gateway(config: &Config) -> anyhow::Result<DeliveryGateway> {
    let channels = [DeliveryChannel::Email, DeliveryChannel::Push];
    let senders: Vec<Arc<dyn DeliverySender>> = match config.relay_url.as_deref() {
        Some(url) => {
            info!(relay = url, "delivering through HTTP relay");
            channels
                .into_iter()
                .map(|channel| HttpRelaySender::new(url, channel))
                .collect::<anyhow::Result<_>>()?
        }
        None => {
            warn!("DELIVERY_RELAY_URL not set, deliveries are only logged");
            channels.into_iter().map(LogSender::new).collect()
        }
    };
    Ok(DeliveryGateway::new(senders))
}
