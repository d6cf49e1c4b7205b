//! In-memory integration store with optional JSON snapshot persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{IntegrationQuery, UniformRepo};
use crate::error::{UniformError, UniformResult};
use crate::models::{Integration, Subscription};

const SNAPSHOT_FILE: &str = "integrations.json";

/// Integration records keyed by id.
///
/// When a data directory is configured, every mutation is applied to a copy
/// of the map and committed only after `integrations.json` was rewritten,
/// under the write lock. A failed write leaves memory and file unchanged.
pub struct MemoryRepo {
    integrations: RwLock<HashMap<String, Integration>>,
    snapshot: Option<PathBuf>,
}

impl MemoryRepo {
    /// Create an empty, non-persistent store
    pub fn new() -> Self {
        Self {
            integrations: RwLock::new(HashMap::new()),
            snapshot: None,
        }
    }

    /// Create a store backed by `data_dir/integrations.json`, loading any
    /// existing snapshot.
    pub fn with_snapshot(data_dir: impl AsRef<Path>) -> UniformResult<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SNAPSHOT_FILE);

        let mut integrations = HashMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let items: Vec<Integration> = serde_json::from_str(&content)?;
            for integration in items {
                integrations.insert(integration.id.clone(), integration);
            }
            debug!(path = %path.display(), count = integrations.len(), "Loaded registry snapshot");
        }

        Ok(Self {
            integrations: RwLock::new(integrations),
            snapshot: Some(path),
        })
    }

    /// Number of stored integrations
    pub async fn len(&self) -> usize {
        self.integrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.integrations.read().await.is_empty()
    }

    async fn persist(&self, map: &HashMap<String, Integration>) -> UniformResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let mut items: Vec<&Integration> = map.values().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        let content = serde_json::to_string_pretty(&items)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            warn!(path = %path.display(), "Failed to replace registry snapshot: {}", e);
            UniformError::from(e)
        })
    }
}

impl MemoryRepo {
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, Integration>) -> UniformResult<T>,
    ) -> UniformResult<T> {
        let mut map = self.integrations.write().await;
        if self.snapshot.is_none() {
            return change(&mut *map);
        }
        let mut candidate = map.clone();
        let out = change(&mut candidate)?;
        self.persist(&candidate).await?;
        *map = candidate;
        Ok(out)
    }
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: &str) -> UniformError {
    UniformError::not_found(format!("integration {id}"))
}

#[async_trait]
impl UniformRepo for MemoryRepo {
    async fn find(&self, query: &IntegrationQuery) -> UniformResult<Vec<Integration>> {
        let map = self.integrations.read().await;
        let mut items: Vec<Integration> = map
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn insert(&self, integration: Integration) -> UniformResult<()> {
        self.mutate(|map| {
            if map.contains_key(&integration.id) {
                return Err(UniformError::AlreadyExists(format!(
                    "integration {}",
                    integration.id
                )));
            }
            map.insert(integration.id.clone(), integration);
            Ok(())
        })
        .await
    }

    async fn update_last_seen(
        &self,
        id: &str,
        seen: DateTime<Utc>,
    ) -> UniformResult<Integration> {
        self.mutate(|map| {
            let integration = map.get_mut(id).ok_or_else(|| not_found(id))?;
            integration.metadata.last_seen = Some(seen);
            Ok(integration.clone())
        })
        .await
    }

    async fn update_version_info(
        &self,
        id: &str,
        integration_version: &str,
        distributor_version: &str,
        seen: DateTime<Utc>,
    ) -> UniformResult<Integration> {
        self.mutate(|map| {
            let integration = map.get_mut(id).ok_or_else(|| not_found(id))?;
            integration.metadata.integration_version = integration_version.to_string();
            integration.metadata.distributor_version = distributor_version.to_string();
            integration.metadata.last_seen = Some(seen);
            Ok(integration.clone())
        })
        .await
    }

    async fn delete(&self, id: &str) -> UniformResult<()> {
        self.mutate(|map| match map.remove(id) {
            Some(_) => Ok(()),
            None => Err(not_found(id)),
        })
        .await
    }

    async fn upsert_subscription(
        &self,
        integration_id: &str,
        subscription: Subscription,
    ) -> UniformResult<()> {
        self.mutate(|map| {
            let integration = map
                .get_mut(integration_id)
                .ok_or_else(|| not_found(integration_id))?;
            match integration
                .subscriptions
                .iter_mut()
                .find(|s| s.id == subscription.id)
            {
                Some(existing) => *existing = subscription,
                None => integration.subscriptions.push(subscription),
            }
            Ok(())
        })
        .await
    }

    async fn delete_subscription(
        &self,
        integration_id: &str,
        subscription_id: &str,
    ) -> UniformResult<()> {
        self.mutate(|map| {
            let integration = map
                .get_mut(integration_id)
                .ok_or_else(|| not_found(integration_id))?;
            let before = integration.subscriptions.len();
            integration.subscriptions.retain(|s| s.id != subscription_id);
            if integration.subscriptions.len() == before {
                return Err(UniformError::not_found(format!(
                    "subscription {subscription_id} of integration {integration_id}"
                )));
            }
            Ok(())
        })
        .await
    }
}
