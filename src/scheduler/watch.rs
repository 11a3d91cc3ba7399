//! Watch items: which policies react to pushes and deletions in a namespace

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchItem {
    pub id: i64,
    pub policy_id: i64,
    pub namespace: String,
    pub on_push: bool,
    pub on_deletion: bool,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl WatchItem {
    pub fn new(policy_id: i64, namespace: impl Into<String>, on_push: bool, on_deletion: bool) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            policy_id,
            namespace: namespace.into(),
            on_push,
            on_deletion,
            creation_time: now,
            update_time: now,
        }
    }

    pub fn watches(&self, operation: WatchOperation) -> bool {
        match operation {
            WatchOperation::Push => self.on_push,
            WatchOperation::Delete => self.on_deletion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchOperation {
    Push,
    Delete,
}

/// Persistence of watch items, owned by an external collaborator
#[async_trait]
pub trait WatchItemDao: Send + Sync {
    /// Store the item and return its id.
    async fn add(&self, item: WatchItem) -> Result<i64>;

    async fn delete_by_policy_id(&self, policy_id: i64) -> Result<()>;

    /// Items watching `namespace` for `operation`.
    async fn get(&self, namespace: &str, operation: WatchOperation) -> Result<Vec<WatchItem>>;
}

#[derive(Debug, Default)]
pub struct InMemoryWatchItemDao {
    items: Mutex<Vec<WatchItem>>,
    next_id: AtomicI64,
}

impl InMemoryWatchItemDao {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatchItemDao for InMemoryWatchItemDao {
    async fn add(&self, mut item: WatchItem) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        item.id = id;
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(item);
        Ok(id)
    }

    async fn delete_by_policy_id(&self, policy_id: i64) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|item| item.policy_id != policy_id);
        Ok(())
    }

    async fn get(&self, namespace: &str, operation: WatchOperation) -> Result<Vec<WatchItem>> {
        Ok(self
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|item| item.namespace == namespace && item.watches(operation))
            .cloned()
            .collect())
    }
}
