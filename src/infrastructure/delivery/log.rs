use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    application::services::sender::DeliverySender,
    domain::{
        models::DeliveryChannel,
        value_objects::{DeliveryPayload, SendOutcome},
    },
};

/// Writes the delivery to the log instead of transmitting it.
pub struct LogSender {
    channel: DeliveryChannel,
}

impl LogSender {
    pub fn new(channel: DeliveryChannel) -> Arc<dyn DeliverySender> {
        Arc::new(Self { channel }) as Arc<dyn DeliverySender>
    }
}

#[async_trait]
impl DeliverySender for LogSender {
    fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    async fn send(&self, payload: &DeliveryPayload) -> anyhow::Result<SendOutcome> {
        info!(
            channel = self.channel.as_str(),
            message_id = %payload.message_id,
            recipient = %payload.recipient.address,
            subject = %payload.subject,
            attempt = payload.attempt,
            "delivering message"
        );
        Ok(SendOutcome::Sent)
    }
}
