//! Forwards error reports of the integration to the uniform error log.
//!
//! Watches the events the relay passed on. An explicit `sh.keptn.log.error`
//! event, or a `.finished` event whose `data.status` is `errored`, becomes
//! one [`LogEntry`] tagged with the registered integration id.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use uniform::{EventEnvelope, LogEntry};

use crate::api::UniformApi;
use crate::control_plane::ControlPlane;

/// Event type integrations use to report an error directly.
pub const ERROR_LOG_EVENT: &str = "sh.keptn.log.error";

/// The log entry `event` stands for, if it reports an error.
pub fn log_entry(integration_id: &str, event: &EventEnvelope) -> Option<LogEntry> {
    let errored_finish =
        event.event_type.ends_with(".finished") && event.data_field("status") == Some("errored");
    if event.event_type != ERROR_LOG_EVENT && !errored_finish {
        return None;
    }
    let mut entry = LogEntry::new(
        integration_id,
        event.data_field("message").unwrap_or_default(),
    );
    entry.shkeptncontext = event.shkeptncontext.clone().unwrap_or_default();
    entry.triggered_id = event.triggeredid.clone().unwrap_or_default();
    entry.task = event
        .task()
        .or_else(|| event.data_field("task"))
        .unwrap_or_default()
        .to_string();
    entry.time = event.time;
    Some(entry)
}

pub struct ErrorLogForwarder {
    api: Arc<dyn UniformApi>,
    control_plane: Arc<ControlPlane>,
}

impl ErrorLogForwarder {
    pub fn new(api: Arc<dyn UniformApi>, control_plane: Arc<ControlPlane>) -> Self {
        Self { api, control_plane }
    }

    /// Drain `events` until every sender is gone. Returns how many entries
    /// were accepted by the uniform.
    pub async fn run(self, mut events: mpsc::Receiver<EventEnvelope>) -> usize {
        let mut sent = 0;
        while let Some(event) = events.recv().await {
            let integration_id = match self.control_plane.registration().await {
                Some(registration) if registration.has_identity() => registration.id,
                _ => {
                    debug!(event_id = %event.id, "No uniform identity, error log skipped");
                    continue;
                }
            };
            let Some(entry) = log_entry(&integration_id, &event) else {
                continue;
            };
            match self.api.send_logs(std::slice::from_ref(&entry)).await {
                Ok(()) => {
                    debug!(integration_id = %integration_id, task = %entry.task, "Error log forwarded");
                    sent += 1;
                }
                Err(e) => warn!(integration_id = %integration_id, "Could not forward error log: {}", e),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MockUniformApi};
    use crate::config::{ControlPlaneConfig, SubscriptionSourceConfig};
    use crate::subscription_source::UniformSubscriptionSource;
    use crate::transport::{BusTransport, LocalBus};
    use serde_json::json;
    use std::sync::Mutex;
    use uniform::{Integration, MetaData};

    fn errored(event_type: &str) -> EventEnvelope {
        let mut e = EventEnvelope::new(
            event_type,
            json!({ "status": "errored", "message": "helm upgrade failed" }),
        );
        e.shkeptncontext = Some("ctx-1".into());
        e.triggeredid = Some("trig-1".into());
        e
    }

    fn plane_registered_as(id: &'static str) -> Arc<ControlPlane> {
        let mut api = MockUniformApi::new();
        api.expect_register().returning(move |_| Ok(id.to_string()));
        let source = UniformSubscriptionSource::new(Arc::new(api), SubscriptionSourceConfig::default());
        let transport = BusTransport::new(Arc::new(LocalBus::new()), Default::default());
        Arc::new(ControlPlane::new(
            Arc::new(source),
            Arc::new(transport),
            ControlPlaneConfig::default(),
        ))
    }

    #[test]
    fn test_errored_finish_becomes_entry() {
        let entry = log_entry("i1", &errored("sh.keptn.event.deployment.finished")).unwrap();
        assert_eq!(entry.integration_id, "i1");
        assert_eq!(entry.message, "helm upgrade failed");
        assert_eq!(entry.task, "deployment");
        assert_eq!(entry.shkeptncontext, "ctx-1");
        assert_eq!(entry.triggered_id, "trig-1");
    }

    #[test]
    fn test_explicit_error_event_uses_data_task() {
        let event = EventEnvelope::new(
            ERROR_LOG_EVENT,
            json!({ "message": "cannot reach cluster", "task": "test" }),
        );
        let entry = log_entry("i1", &event).unwrap();
        assert_eq!(entry.task, "test");
        assert_eq!(entry.message, "cannot reach cluster");
    }

    #[test]
    fn test_successful_or_unfinished_events_are_ignored() {
        let ok = EventEnvelope::new(
            "sh.keptn.event.deployment.finished",
            json!({ "status": "succeeded" }),
        );
        assert!(log_entry("i1", &ok).is_none());
        assert!(log_entry("i1", &errored("sh.keptn.event.deployment.started")).is_none());
    }

    #[tokio::test]
    async fn test_forwards_only_errors_once_registered() {
        let sent: Arc<Mutex<Vec<LogEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let sent_in = sent.clone();
        let mut api = MockUniformApi::new();
        api.expect_send_logs().times(1).returning(|_| {
            Err(ApiError::Status {
                status: 503,
                message: "unavailable".into(),
            })
        });
        api.expect_send_logs().returning(move |entries| {
            sent_in.lock().unwrap().extend_from_slice(entries);
            Ok(())
        });

        let plane = plane_registered_as("i-42");
        let (tx, rx) = mpsc::channel(8);
        let forwarder = tokio::spawn(ErrorLogForwarder::new(Arc::new(api), plane.clone()).run(rx));

        // Before registration there is no identity to log under.
        tx.send(errored("sh.keptn.event.test.finished")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        plane
            .register(&Integration::new("svc", MetaData::default()))
            .await
            .unwrap();

        tx.send(errored("sh.keptn.event.test.finished")).await.unwrap();
        tx.send(EventEnvelope::new("sh.keptn.event.test.started", json!({})))
            .await
            .unwrap();
        tx.send(errored("sh.keptn.event.release.finished")).await.unwrap();
        drop(tx);

        assert_eq!(forwarder.await.unwrap(), 1);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].integration_id, "i-42");
        assert_eq!(sent[0].task, "release");
    }
}
