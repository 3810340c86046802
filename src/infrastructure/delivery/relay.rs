use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    application::services::sender::DeliverySender,
    domain::{
        models::DeliveryChannel,
        value_objects::{DeliveryPayload, SendOutcome},
    },
};

/// Hands payloads to an HTTP relay that owns the actual transport (SMTP,
/// push gateway).
pub struct HttpRelaySender {
    http: Client,
    endpoint: String,
    channel: DeliveryChannel,
}

impl HttpRelaySender {
    pub fn new(
        base_url: &str,
        channel: DeliveryChannel,
    ) -> anyhow::Result<Arc<dyn DeliverySender>> {
        let http = Client::builder()
            .user_agent("message-scheduler/relay")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build relay client")?;
        Ok(Arc::new(Self {
            http,
            endpoint: endpoint_for(base_url, channel),
            channel,
        }) as Arc<dyn DeliverySender>)
    }
}

fn endpoint_for(base_url: &str, channel: DeliveryChannel) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), channel.as_str())
}

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    /// Lets the relay drop duplicates of a redelivered attempt.
    idempotency_key: String,
    message_id: Uuid,
    to: &'a str,
    subject: &'a str,
    body: &'a str,
    attempt: u32,
}

impl<'a> RelayRequest<'a> {
    fn from_payload(payload: &'a DeliveryPayload) -> Self {
        Self {
            idempotency_key: format!(
                "{}:{}",
                payload.message_id,
                payload.scheduled_for.timestamp()
            ),
            message_id: payload.message_id,
            to: &payload.recipient.address,
            subject: &payload.subject,
            body: &payload.body,
            attempt: payload.attempt,
        }
    }
}

#[async_trait]
impl DeliverySender for HttpRelaySender {
    fn channel(&self) -> DeliveryChannel {
        self.channel
    }

    async fn send(&self, payload: &DeliveryPayload) -> anyhow::Result<SendOutcome> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&RelayRequest::from_payload(payload))
            .send()
            .await
            .with_context(|| format!("relay request to {} failed", self.endpoint))?;

        let status = response.status();
        if status.is_success() {
            return Ok(SendOutcome::Sent);
        }
        let body = response.text().await.unwrap_or_default();
        Ok(SendOutcome::Failed {
            detail: format!("relay answered {status}: {}", body.trim()),
        })
    }
}
