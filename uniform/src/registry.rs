//! Uniform registry: idempotent registration, heartbeat and subscription CRUD.
//!
//! # Registration
//!
//! ```text
//! Register(integration)
//!   ├─ validate embedded subscriptions ── invalid → ValidationError (no mutation)
//!   ├─ lookup by (name, namespace)
//!   │    └─ found → refresh existing (versions changed ? version info : lastSeen) → 200
//!   └─ insert with id = hash(name, namespace, node)
//!        ├─ ok → 201
//!        └─ AlreadyExists (lost a race) → refresh existing → 200
//! ```
//!
//! Lookup and insert are separate store calls. Concurrent first
//! registrations of one identity converge through the duplicate-key
//! fallback rather than a lock.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{UniformError, UniformResult};
use crate::models::{Integration, Subscription};
use crate::store::{IntegrationQuery, UniformRepo};
use crate::validation::{validate_integration, validate_subscription};

/// Result of a registration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub id: String,
    /// `true` when a new record was inserted (HTTP 201), `false` when an
    /// existing one was refreshed (HTTP 200).
    pub created: bool,
}

/// Registry service over a [`UniformRepo`].
#[derive(Clone)]
pub struct UniformRegistry {
    repo: Arc<dyn UniformRepo>,
}

fn new_subscription_id() -> String {
    Uuid::new_v4().to_string()
}

impl UniformRegistry {
    pub fn new(repo: Arc<dyn UniformRepo>) -> Self {
        Self { repo }
    }

    /// Create or refresh the record for `integration`'s identity.
    pub async fn register(&self, mut integration: Integration) -> UniformResult<RegisterOutcome> {
        validate_integration(&integration)?;

        let info = format!(
            "name={}, namespace={}",
            integration.name, integration.metadata.namespace
        );
        let existing = self
            .repo
            .find(&IntegrationQuery::by_name(
                &integration.name,
                &integration.metadata.namespace,
            ))
            .await?;
        if let Some(found) = existing.into_iter().next() {
            debug!(integration = %info, id = %found.id, "Found existing integration");
            self.refresh_existing(&found.id, &integration).await?;
            return Ok(RegisterOutcome {
                id: found.id,
                created: false,
            });
        }

        let id = integration.identity().hash();
        integration.id = id.clone();
        integration.metadata.last_seen = Some(Utc::now());
        for subscription in &mut integration.subscriptions {
            subscription.id = new_subscription_id();
        }

        debug!(integration = %info, id = %id, "No existing integration, creating");
        match self.repo.insert(integration.clone()).await {
            Ok(()) => {
                info!(integration = %info, id = %id, "Integration registered");
                Ok(RegisterOutcome { id, created: true })
            }
            Err(UniformError::AlreadyExists(_)) => {
                info!(id = %id, "Concurrent registration detected, updating instead");
                self.refresh_existing(&id, &integration).await?;
                Ok(RegisterOutcome { id, created: false })
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrite version info on an upgrade/downgrade, otherwise only bump `lastSeen`.
    async fn refresh_existing(&self, id: &str, incoming: &Integration) -> UniformResult<Integration> {
        let stored = self.stored(id).await?;
        let now = Utc::now();
        if stored.metadata.integration_version != incoming.metadata.integration_version
            || stored.metadata.distributor_version != incoming.metadata.distributor_version
        {
            info!(
                id,
                from = %stored.metadata.integration_version,
                to = %incoming.metadata.integration_version,
                "Integration version changed"
            );
            self.repo
                .update_version_info(
                    id,
                    &incoming.metadata.integration_version,
                    &incoming.metadata.distributor_version,
                    now,
                )
                .await
        } else {
            self.repo.update_last_seen(id, now).await
        }
    }

    async fn stored(&self, id: &str) -> UniformResult<Integration> {
        self.repo
            .find(&IntegrationQuery::by_id(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| UniformError::not_found(format!("integration {id}")))
    }

    /// Delete a registration. `NotFound` if nothing was deleted.
    pub async fn unregister(&self, id: &str) -> UniformResult<()> {
        self.repo.delete(id).await?;
        info!(id, "Integration unregistered");
        Ok(())
    }

    /// Heartbeat: refresh `lastSeen` and return the current record.
    pub async fn keep_alive(&self, id: &str) -> UniformResult<Integration> {
        self.repo.update_last_seen(id, Utc::now()).await
    }

    pub async fn get_registrations(
        &self,
        query: &IntegrationQuery,
    ) -> UniformResult<Vec<Integration>> {
        self.repo.find(query).await
    }

    pub async fn get_subscriptions(&self, integration_id: &str) -> UniformResult<Vec<Subscription>> {
        Ok(self.stored(integration_id).await?.subscriptions)
    }

    pub async fn get_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
    ) -> UniformResult<Subscription> {
        self.stored(integration_id)
            .await?
            .subscription(subscription_id)
            .cloned()
            .ok_or_else(|| {
                UniformError::not_found(format!(
                    "subscription {subscription_id} of integration {integration_id}"
                ))
            })
    }

    /// Add a subscription; the registry always assigns a fresh id.
    pub async fn create_subscription(
        &self,
        integration_id: &str,
        mut subscription: Subscription,
    ) -> UniformResult<String> {
        let owner = self.stored(integration_id).await?;
        validate_subscription(&subscription, Some(owner.name.as_str()))?;

        subscription.id = new_subscription_id();
        let id = subscription.id.clone();
        self.repo
            .upsert_subscription(integration_id, subscription)
            .await?;
        debug!(integration_id, subscription_id = %id, "Subscription created");
        Ok(id)
    }

    /// Replace (or add) the subscription identified by the path id.
    pub async fn update_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
        mut subscription: Subscription,
    ) -> UniformResult<String> {
        let owner = self.stored(integration_id).await?;
        validate_subscription(&subscription, Some(owner.name.as_str()))?;

        subscription.id = subscription_id.to_string();
        self.repo
            .upsert_subscription(integration_id, subscription)
            .await?;
        debug!(integration_id, subscription_id, "Subscription updated");
        Ok(subscription_id.to_string())
    }

    pub async fn delete_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
    ) -> UniformResult<()> {
        self.repo
            .delete_subscription(integration_id, subscription_id)
            .await
    }
}
