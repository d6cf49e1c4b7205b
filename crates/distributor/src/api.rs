//! HTTP client for the uniform registry.
//!
//! [`UniformApi`] is the seam the subscription source, the poll transport,
//! the outbound relay and the error log forwarder talk through; [`UniformClient`] is the reqwest implementation. Every
//! request is bounded by the timeout the client was built with.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use uniform::{
    ConsumedRequest, CreateSubscriptionResponse, ErrorBody, EventEnvelope, Integration,
    IntegrationQuery, LogEntry, LogsBody, RegisterResponse, Subscription,
};

use crate::error::RetryCategory;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The registry has no record for the requested id.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registry returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Registry unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid registry response: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// "Nothing to do" as opposed to "infrastructure broken".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Transport(_) | Self::Decode(_) => RetryCategory::Transient,
            Self::Status { status, .. } if *status >= 500 || *status == 429 => {
                RetryCategory::Transient
            }
            _ => RetryCategory::Fatal,
        }
    }
}

/// Registry operations used by the distributor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UniformApi: Send + Sync {
    /// Register (or refresh) an integration. Returns its id.
    async fn register(&self, integration: &Integration) -> Result<String, ApiError>;

    async fn unregister(&self, integration_id: &str) -> Result<(), ApiError>;

    /// Heartbeat. Returns the stored integration including its subscriptions.
    async fn ping(&self, integration_id: &str) -> Result<Integration, ApiError>;

    async fn get_registrations(
        &self,
        query: &IntegrationQuery,
    ) -> Result<Vec<Integration>, ApiError>;

    async fn get_subscriptions(&self, integration_id: &str) -> Result<Vec<Subscription>, ApiError>;

    async fn create_subscription(
        &self,
        integration_id: &str,
        subscription: &Subscription,
    ) -> Result<String, ApiError>;

    async fn update_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
        subscription: &Subscription,
    ) -> Result<String, ApiError>;

    async fn delete_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
    ) -> Result<(), ApiError>;

    /// Pending events of `event_type` (literal or pattern) not yet consumed by `consumer`.
    async fn pending_events(
        &self,
        event_type: &str,
        consumer: &str,
    ) -> Result<Vec<EventEnvelope>, ApiError>;

    async fn mark_consumed(&self, consumer: &str, ids: &[String]) -> Result<(), ApiError>;

    /// Hand an event to the control plane. Returns the id it was queued under.
    async fn publish_event(&self, event: &EventEnvelope) -> Result<String, ApiError>;

    async fn send_logs(&self, entries: &[LogEntry]) -> Result<(), ApiError>;
}

/// reqwest-backed [`UniformApi`].
#[derive(Clone)]
pub struct UniformClient {
    http: reqwest::Client,
    base: Url,
}

impl UniformClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base = parse_base(endpoint)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    /// Join percent-encoded path segments onto the base URL, so event types
    /// such as `sh.keptn.event.>` travel as a single segment.
    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn registration_url(&self, rest: &[&str]) -> Result<Url, ApiError> {
        let mut segments = vec!["uniform", "registration"];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }
}

pub(crate) fn parse_base(endpoint: &str) -> Result<Url, ApiError> {
    let url = Url::parse(endpoint).map_err(|e| ApiError::InvalidUrl(format!("{endpoint}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(ApiError::InvalidUrl(endpoint.to_string()));
    }
    Ok(url)
}

/// Map non-success statuses to [`ApiError`], reading the registry's error body when present.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let fallback = status.canonical_reason().unwrap_or("unknown").to_string();
    let message = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.message)
        .unwrap_or(fallback);
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound(message));
    }
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    check(response)
        .await?
        .json::<T>()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl UniformApi for UniformClient {
    async fn register(&self, integration: &Integration) -> Result<String, ApiError> {
        let url = self.registration_url(&[])?;
        let response = self.http.post(url).json(integration).send().await?;
        let created = response.status() == StatusCode::CREATED;
        let body: RegisterResponse = decode(response).await?;
        debug!(integration_id = %body.id, created, "Registered with uniform");
        Ok(body.id)
    }

    async fn unregister(&self, integration_id: &str) -> Result<(), ApiError> {
        let url = self.registration_url(&[integration_id])?;
        check(self.http.delete(url).send().await?).await?;
        Ok(())
    }

    async fn ping(&self, integration_id: &str) -> Result<Integration, ApiError> {
        let url = self.registration_url(&[integration_id, "ping"])?;
        decode(self.http.put(url).send().await?).await
    }

    async fn get_registrations(
        &self,
        query: &IntegrationQuery,
    ) -> Result<Vec<Integration>, ApiError> {
        let url = self.registration_url(&[])?;
        decode(self.http.get(url).query(query).send().await?).await
    }

    async fn get_subscriptions(&self, integration_id: &str) -> Result<Vec<Subscription>, ApiError> {
        let url = self.registration_url(&[integration_id, "subscription"])?;
        decode(self.http.get(url).send().await?).await
    }

    async fn create_subscription(
        &self,
        integration_id: &str,
        subscription: &Subscription,
    ) -> Result<String, ApiError> {
        let url = self.registration_url(&[integration_id, "subscription"])?;
        let body: CreateSubscriptionResponse =
            decode(self.http.post(url).json(subscription).send().await?).await?;
        Ok(body.id)
    }

    async fn update_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
        subscription: &Subscription,
    ) -> Result<String, ApiError> {
        let url = self.registration_url(&[integration_id, "subscription", subscription_id])?;
        let body: CreateSubscriptionResponse =
            decode(self.http.put(url).json(subscription).send().await?).await?;
        Ok(body.id)
    }

    async fn delete_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
    ) -> Result<(), ApiError> {
        let url = self.registration_url(&[integration_id, "subscription", subscription_id])?;
        check(self.http.delete(url).send().await?).await?;
        Ok(())
    }

    async fn pending_events(
        &self,
        event_type: &str,
        consumer: &str,
    ) -> Result<Vec<EventEnvelope>, ApiError> {
        let url = self.url(&["event", "triggered", event_type])?;
        decode(
            self.http
                .get(url)
                .query(&[("integrationId", consumer)])
                .send()
                .await?,
        )
        .await
    }

    async fn mark_consumed(&self, consumer: &str, ids: &[String]) -> Result<(), ApiError> {
        let url = self.url(&["event", "consumed"])?;
        let body = ConsumedRequest {
            integration_id: consumer.to_string(),
            ids: ids.to_vec(),
        };
        check(self.http.post(url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn publish_event(&self, event: &EventEnvelope) -> Result<String, ApiError> {
        let url = self.url(&["event"])?;
        let body: RegisterResponse = decode(self.http.post(url).json(event).send().await?).await?;
        debug!(event_id = %body.id, event_type = %event.event_type, "Event published to control plane");
        Ok(body.id)
    }

    async fn send_logs(&self, entries: &[LogEntry]) -> Result<(), ApiError> {
        let url = self.url(&["uniform", "log"])?;
        let body = LogsBody {
            logs: entries.to_vec(),
        };
        check(self.http.post(url).json(&body).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> UniformClient {
        UniformClient::new(endpoint, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_registration_paths() {
        let c = client("http://localhost:8080");
        assert_eq!(
            c.registration_url(&["abc", "ping"]).unwrap().as_str(),
            "http://localhost:8080/uniform/registration/abc/ping"
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let c = client("http://proxy:8080/api/");
        assert_eq!(
            c.registration_url(&[]).unwrap().as_str(),
            "http://proxy:8080/api/uniform/registration"
        );
        // Default ports are normalised away.
        let c = client("http://proxy:80/api");
        assert_eq!(
            c.registration_url(&[]).unwrap().as_str(),
            "http://proxy/api/uniform/registration"
        );
    }

    #[test]
    fn test_wildcard_event_type_is_one_segment() {
        let c = client("http://localhost:8080");
        let url = c.url(&["event", "triggered", "sh.keptn.event.>"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/event/triggered/sh.keptn.event.%3E"
        );
    }

    #[test]
    fn test_invalid_endpoints_rejected() {
        assert!(matches!(
            UniformClient::new("not a url", Duration::from_secs(1)),
            Err(ApiError::InvalidUrl(_))
        ));
        assert!(matches!(
            UniformClient::new("mailto:ops@example.com", Duration::from_secs(1)),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(ApiError::NotFound("x".into()).is_not_found());
        assert!(!ApiError::Decode("x".into()).is_not_found());
        assert_eq!(
            ApiError::Status {
                status: 429,
                message: String::new()
            }
            .retry_category(),
            RetryCategory::Transient
        );
        assert_eq!(
            ApiError::NotFound("x".into()).retry_category(),
            RetryCategory::Fatal
        );
    }
}
