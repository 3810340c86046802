use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    models::DeliveryChannel,
    value_objects::{DeliveryPayload, SendOutcome},
};

/// Transmits prepared payloads over one delivery channel.
///
/// `Ok(SendOutcome::Failed { .. })` means the transport answered and refused;
/// `Err` means it could not be reached. Both count as a failed attempt.
#[async_trait]
pub trait DeliverySender: Send + Sync {
    fn channel(&self) -> DeliveryChannel;
    async fn send(&self, payload: &DeliveryPayload) -> anyhow::Result<SendOutcome>;
}

#[derive(Clone, Default)]
pub struct DeliveryGateway {
    senders: HashMap<DeliveryChannel, Arc<dyn DeliverySender>>,
}

impl DeliveryGateway {
    pub fn new(senders: Vec<Arc<dyn DeliverySender>>) -> Self {
        let mut map = HashMap::new();
        for sender in senders {
            map.insert(sender.channel(), sender);
        }
        Self { senders: map }
    }

    pub fn get(&self, channel: DeliveryChannel) -> Option<Arc<dyn DeliverySender>> {
        self.senders.get(&channel).cloned()
    }
}
