//! Persistence seam for integration records.
//!
//! The registry talks to storage only through [`UniformRepo`]. The in-memory
//! implementation in [`memory`] enforces the same unique-id constraint a
//! document store index would, so the registry's duplicate-key fallback is
//! exercised identically.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UniformResult;
use crate::models::{Integration, Subscription};

pub use memory::MemoryRepo;

/// Filter for integration lookups (also the `GET /uniform/registration` query).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl IntegrationQuery {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn by_name(name: &str, namespace: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Self::default()
        }
    }

    /// Whether `integration` satisfies every constraint in this query.
    ///
    /// Scope constraints (project/stage/service) hold when any subscription
    /// lists the value or leaves that list empty.
    pub fn matches(&self, integration: &Integration) -> bool {
        let exact =
            |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        if !exact(&self.id, &integration.id)
            || !exact(&self.name, &integration.name)
            || !exact(&self.namespace, &integration.metadata.namespace)
        {
            return false;
        }

        if self.project.is_none() && self.stage.is_none() && self.service.is_none() {
            return true;
        }
        integration.subscriptions.iter().any(|s| {
            s.filter.admits_query(
                self.project.as_deref(),
                self.stage.as_deref(),
                self.service.as_deref(),
            )
        })
    }
}

/// Storage operations the registry needs.
#[async_trait]
pub trait UniformRepo: Send + Sync {
    /// All integrations matching `query`, ordered by name then id.
    async fn find(&self, query: &IntegrationQuery) -> UniformResult<Vec<Integration>>;

    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, integration: Integration) -> UniformResult<()>;

    /// Refresh `lastSeen`. Fails with `NotFound`; never creates a record.
    async fn update_last_seen(&self, id: &str, seen: DateTime<Utc>)
        -> UniformResult<Integration>;

    /// Overwrite the version fields and `lastSeen`.
    async fn update_version_info(
        &self,
        id: &str,
        integration_version: &str,
        distributor_version: &str,
        seen: DateTime<Utc>,
    ) -> UniformResult<Integration>;

    /// Remove a record. Fails with `NotFound` if nothing was deleted.
    async fn delete(&self, id: &str) -> UniformResult<()>;

    /// Replace the subscription with the same id, or append it.
    async fn upsert_subscription(
        &self,
        integration_id: &str,
        subscription: Subscription,
    ) -> UniformResult<()>;

    /// Remove one subscription. Fails with `NotFound` if either id is unknown.
    async fn delete_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
    ) -> UniformResult<()>;
}
