//! Delivers forwarded events to the local integration over HTTP.

use std::time::Duration;

use reqwest::Url;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use uniform::EventEnvelope;

use crate::api::{parse_base, ApiError};

pub struct Forwarder {
    http: reqwest::Client,
    recipient: Url,
}

impl Forwarder {
    pub fn new(recipient: &str, timeout: Duration) -> Result<Self, ApiError> {
        let recipient = parse_base(recipient)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, recipient })
    }

    pub fn recipient(&self) -> &Url {
        &self.recipient
    }

    /// POST `event` as JSON to the recipient.
    pub async fn forward(&self, event: &EventEnvelope) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.recipient.clone())
            .json(event)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }
        Ok(())
    }

    /// Drain `events` until every sender is dropped. Returns how many
    /// deliveries succeeded.
    pub async fn run(self, mut events: mpsc::Receiver<EventEnvelope>) -> usize {
        info!(recipient = %self.recipient, "Forwarder started");
        let mut delivered = 0;
        while let Some(event) = events.recv().await {
            match self.forward(&event).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(event_id = %event.id, event_type = %event.event_type, "Event forwarded");
                }
                Err(e) => {
                    warn!(event_id = %event.id, "Could not forward event: {}", e);
                }
            }
        }
        info!(delivered, "Forwarder stopped");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_recipient() {
        assert!(matches!(
            Forwarder::new("::", Duration::from_secs(1)),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_recipient_is_logged_not_fatal() {
        // Port 9 (discard) on localhost is closed in test environments.
        let forwarder = Forwarder::new("http://127.0.0.1:9/", Duration::from_millis(200)).unwrap();
        let (tx, rx) = mpsc::channel(2);
        tx.send(EventEnvelope::new("t1", serde_json::json!({})))
            .await
            .unwrap();
        drop(tx);
        assert_eq!(forwarder.run(rx).await, 0);
    }
}
