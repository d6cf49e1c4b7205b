//! Wire and storage types for the uniform registry.
//!
//! The JSON shape is shared by the registry HTTP surface and the distributor
//! client, so field names follow the camelCase wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::subject_matches;

/// Separator used when hashing identity fields. NUL cannot appear in
/// Kubernetes names, so distinct triples never collide on concatenation.
const ID_SEPARATOR: &[u8] = b"\0";

/// A deployed integration and the events it subscribes to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    /// Deterministic hash of name + namespace + node name, assigned by the registry.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: MetaData,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl Integration {
    pub fn new(name: impl Into<String>, metadata: MetaData) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            metadata,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Identity triple used for deduplicating registrations.
    pub fn identity(&self) -> IntegrationId {
        IntegrationId {
            name: self.name.clone(),
            namespace: self.metadata.namespace.clone(),
            node_name: self.metadata.hostname.clone(),
        }
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == subscription_id)
    }
}

/// Deployment metadata reported by an integration on registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    /// Node the integration runs on (part of the identity).
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub integration_version: String,
    #[serde(default)]
    pub distributor_version: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub deployment_name: String,
    /// Last registration or heartbeat; `None` until the registry has seen it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// The (name, namespace, node) triple an integration id is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntegrationId {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
}

impl IntegrationId {
    /// Lowercase hex blake3 digest of the identity triple.
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(ID_SEPARATOR);
        hasher.update(self.namespace.as_bytes());
        hasher.update(ID_SEPARATOR);
        hasher.update(self.node_name.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// An (event type, filter) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Literal event type or a subject pattern such as `sh.keptn.event.>`.
    pub event: String,
    #[serde(default)]
    pub filter: SubscriptionFilter,
}

impl Subscription {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event: event.into(),
            filter: SubscriptionFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Whether `event` is selected by this subscription's type and scope.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        subject_matches(&self.event, &event.event_type)
            && self
                .filter
                .admits_event(event.project(), event.stage(), event.service())
    }
}

/// Scope restriction for a subscription. An empty list matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl SubscriptionFilter {
    pub fn new<P, S, V>(projects: P, stages: S, services: V) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            projects: projects.into_iter().map(Into::into).collect(),
            stages: stages.into_iter().map(Into::into).collect(),
            services: services.into_iter().map(Into::into).collect(),
        }
    }

    /// Event scope check: a restricted list requires the event to carry a
    /// listed value.
    pub fn admits_event(
        &self,
        project: Option<&str>,
        stage: Option<&str>,
        service: Option<&str>,
    ) -> bool {
        list_admits(&self.projects, project)
            && list_admits(&self.stages, stage)
            && list_admits(&self.services, service)
    }

    /// Query check: an absent query value places no constraint.
    pub fn admits_query(
        &self,
        project: Option<&str>,
        stage: Option<&str>,
        service: Option<&str>,
    ) -> bool {
        let admits = |list: &[String], value: Option<&str>| match value {
            Some(_) => list_admits(list, value),
            None => true,
        };
        admits(&self.projects, project)
            && admits(&self.stages, stage)
            && admits(&self.services, service)
    }
}

fn list_admits(list: &[String], value: Option<&str>) -> bool {
    list.is_empty() || value.is_some_and(|v| list.iter().any(|item| item == v))
}

/// CloudEvents-shaped envelope carried by both transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default = "default_specversion")]
    pub specversion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shkeptncontext: Option<String>,
    /// Id of the `.triggered` event this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggeredid: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_specversion() -> String {
    "1.0".to_string()
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            source: String::new(),
            specversion: default_specversion(),
            time: None,
            shkeptncontext: None,
            triggeredid: None,
            data,
        }
    }

    pub fn project(&self) -> Option<&str> {
        self.data_field("project")
    }

    pub fn stage(&self) -> Option<&str> {
        self.data_field("stage")
    }

    pub fn service(&self) -> Option<&str> {
        self.data_field("service")
    }

    /// Task segment of a `sh.keptn.event.<task>.<kind>` type.
    pub fn task(&self) -> Option<&str> {
        let mut parts = self.event_type.strip_prefix("sh.keptn.event.")?.rsplitn(2, '.');
        parts.next()?;
        parts.next().filter(|task| !task.is_empty())
    }

    pub fn data_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Body returned by `POST /uniform/registration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
}

/// Body returned by subscription create/update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscriptionResponse {
    pub id: String,
}

/// Body of `POST /event/consumed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedRequest {
    pub integration_id: String,
    pub ids: Vec<String>,
}

/// Error entry an integration reports to the uniform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub integration_id: String,
    pub message: String,
    #[serde(default)]
    pub shkeptncontext: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub triggered_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl LogEntry {
    pub fn new(integration_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            integration_id: integration_id.into(),
            message: message.into(),
            shkeptncontext: String::new(),
            task: String::new(),
            triggered_id: String::new(),
            time: None,
        }
    }
}

/// Body of `POST /uniform/log` and `GET /uniform/log`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsBody {
    pub logs: Vec<LogEntry>,
}
