//! Policy and target persistence
//!
//! Both stores belong to the admin service; the controller only reads
//! through these traits. The in-memory versions back the binary and tests.

use crate::controller::types::{ReplicationPolicy, ReplicationTarget};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<ReplicationPolicy>>;

    async fn list(&self) -> Result<Vec<ReplicationPolicy>>;

    async fn save(&self, policy: ReplicationPolicy) -> Result<()>;

    async fn delete(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<ReplicationTarget>>;

    async fn save(&self, target: ReplicationTarget) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<BTreeMap<i64, ReplicationPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, id: i64) -> Result<Option<ReplicationPolicy>> {
        let policies = self.policies.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(policies.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ReplicationPolicy>> {
        let policies = self.policies.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(policies.values().cloned().collect())
    }

    async fn save(&self, policy: ReplicationPolicy) -> Result<()> {
        self.policies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(policy.id, policy);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.policies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTargetStore {
    targets: RwLock<BTreeMap<i64, ReplicationTarget>>,
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetStore for InMemoryTargetStore {
    async fn get(&self, id: i64) -> Result<Option<ReplicationTarget>> {
        let targets = self.targets.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(targets.get(&id).cloned())
    }

    async fn save(&self, target: ReplicationTarget) -> Result<()> {
        self.targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(target.id, target);
        Ok(())
    }
}
