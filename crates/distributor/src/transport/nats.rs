//! [`MessageBus`] over a NATS server.
//!
//! Integrations with an identity subscribe in a queue group named after
//! their deployment, so replicas of one integration share the work instead
//! of each receiving every event.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uniform::EventEnvelope;

use super::bus::{BusMessage, BusSubscription, MessageBus};
use crate::error::TransportError;

pub struct NatsBus {
    client: async_nats::Client,
    queue_group: Option<String>,
}

impl NatsBus {
    /// Connect to `url`, failing after `timeout` when the server does not answer.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .map_err(|e| TransportError::connect(url, e.to_string()))?;
        info!(url, "Connected to NATS");
        Ok(Self {
            client,
            queue_group: None,
        })
    }

    /// Share deliveries among every subscriber of `group`.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.queue_group = (!group.trim().is_empty()).then_some(group);
        self
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Publish `event` as JSON on the subject equal to its type.
    pub async fn publish_event(&self, event: &EventEnvelope) -> Result<(), TransportError> {
        let subject = event.event_type.clone();
        let payload = serde_json::to_vec(event)
            .map_err(|e| TransportError::publish(&subject, e.to_string()))?;
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| TransportError::publish(&subject, e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::publish(&subject, e.to_string()))?;
        debug!(subject = %subject, event_id = %event.id, "Event published to NATS");
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe(
        &self,
        subject: &str,
        deliver: mpsc::Sender<BusMessage>,
    ) -> Result<BusSubscription, TransportError> {
        if subject.trim().is_empty() {
            return Err(TransportError::subscribe(subject, "empty subject"));
        }
        let subscribed = match &self.queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.clone())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        };
        let mut subscriber =
            subscribed.map_err(|e| TransportError::subscribe(subject, e.to_string()))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pattern = subject.to_string();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = subscriber.next() => next,
                };
                let Some(message) = next else {
                    warn!(subject = %pattern, "NATS subscription closed by server");
                    break;
                };
                let message = BusMessage {
                    subject: message.subject.to_string(),
                    payload: message.payload.to_vec(),
                };
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = deliver.send(message) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                debug!(subject = %pattern, "NATS unsubscribe failed: {}", e);
            }
        });

        debug!(subject = %subject, queue_group = ?self.queue_group, "Subscribed on NATS");
        Ok(BusSubscription::new(subject, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_transient_connect_error() {
        let err = match NatsBus::connect("nats://127.0.0.1:1", Duration::from_millis(500)).await {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(e) => e,
        };
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(err.is_retriable());
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
