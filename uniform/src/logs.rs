//! Error log reported by integrations, newest last, with bounded retention.

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{UniformError, UniformResult};
use crate::models::LogEntry;

/// Default number of entries retained before the oldest are dropped
pub const DEFAULT_LOG_RETENTION: usize = 500;

pub struct ErrorLog {
    entries: RwLock<VecDeque<LogEntry>>,
    retention: usize,
}

impl ErrorLog {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    /// Append `entries`, stamping `time` when missing. Rejects the whole
    /// batch if any entry lacks an integration id.
    pub async fn append(&self, entries: Vec<LogEntry>) -> UniformResult<usize> {
        if let Some(bad) = entries.iter().find(|e| e.integration_id.trim().is_empty()) {
            return Err(UniformError::InvalidLog(format!(
                "entry '{}' has no integration id",
                bad.message
            )));
        }
        let count = entries.len();
        let mut log = self.entries.write().await;
        for mut entry in entries {
            if entry.time.is_none() {
                entry.time = Some(Utc::now());
            }
            debug!(integration_id = %entry.integration_id, task = %entry.task, "Error log entry");
            log.push_back(entry);
        }
        while log.len() > self.retention {
            log.pop_front();
        }
        Ok(count)
    }

    /// Entries of one integration, or all when `integration_id` is `None`.
    pub async fn entries(&self, integration_id: Option<&str>) -> Vec<LogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| integration_id.map_or(true, |id| e.integration_id == id))
            .cloned()
            .collect()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_RETENTION)
    }
}
