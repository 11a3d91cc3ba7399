//! Configuration module for the replication core
//!
//! The core never reads files or the environment on its own; it receives a
//! key/value map from a [`ConfigSource`] and turns it into an explicit
//! [`CoreConfig`]. Unknown keys are rejected at load time.

use crate::error::{ReplicationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

pub const JOBSERVICE_SECRET_ENV: &str = "JOBSERVICE_SECRET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    DbAuth,
    LdapAuth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub auth_mode: AuthMode,
    pub ldap_url: Option<String>,
    pub ldap_search_dn: Option<String>,
    pub ldap_search_password: Option<String>,
    pub ldap_base_dn: Option<String>,
    pub ldap_uid: Option<String>,
    pub ldap_scope: i32,
    /// Seconds
    pub ldap_timeout: u64,
    pub token_service_url: Option<String>,
    pub registry_url: Option<String>,
    pub ui_url: Option<String>,
    pub clair_url: Option<String>,
    pub email_host: Option<String>,
    pub email_port: u16,
    pub email_username: Option<String>,
    pub email_password: Option<String>,
    pub email_ssl: bool,
    pub email_insecure: bool,
    pub email_identity: Option<String>,
    pub project_creation_restriction: Option<String>,
    pub max_job_workers: usize,
    /// Minutes
    pub token_expiration: u64,
    pub admin_initial_password: Option<String>,
    pub with_notary: bool,
    pub with_clair: bool,
    pub read_only: bool,
    pub verify_remote_cert: bool,
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
    pub jobservice_secret: Option<String>,
    pub ui_secret: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::DbAuth,
            ldap_url: None,
            ldap_search_dn: None,
            ldap_search_password: None,
            ldap_base_dn: None,
            ldap_uid: None,
            ldap_scope: 2,
            ldap_timeout: 5,
            token_service_url: None,
            registry_url: None,
            ui_url: None,
            clair_url: None,
            email_host: None,
            email_port: 25,
            email_username: None,
            email_password: None,
            email_ssl: false,
            email_insecure: false,
            email_identity: None,
            project_creation_restriction: None,
            max_job_workers: 3,
            token_expiration: 30,
            admin_initial_password: None,
            with_notary: false,
            with_clair: false,
            read_only: false,
            verify_remote_cert: true,
            registry_username: None,
            registry_password: None,
            jobservice_secret: None,
            ui_secret: None,
        }
    }
}

impl CoreConfig {
    /// Build the option set from a raw map, rejecting unknown keys.
    pub fn from_map(map: HashMap<String, Value>) -> Result<Self> {
        let object: serde_json::Map<String, Value> = map.into_iter().collect();
        let config: CoreConfig = serde_json::from_value(Value::Object(object))
            .map_err(|e| ReplicationError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(source: &dyn ConfigSource) -> Result<Self> {
        Self::from_map(source.load().await?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_job_workers == 0 {
            return Err(ReplicationError::Config(
                "max_job_workers must be at least 1".to_string(),
            ));
        }
        if self.auth_mode == AuthMode::LdapAuth && self.ldap_url.is_none() {
            return Err(ReplicationError::Config(
                "ldap_url is required when auth_mode is ldap_auth".to_string(),
            ));
        }
        Ok(())
    }

    /// The local registry every replication reads from.
    pub fn registry_url(&self) -> Result<&str> {
        self.registry_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ReplicationError::Config("registry_url is not configured".to_string()))
    }
}

/// Resolve the job-service secret, falling back to the environment when the
/// configuration does not carry one.
pub fn jobservice_secret(config: &CoreConfig) -> Option<String> {
    secret_with_fallback(config, |key| std::env::var(key).ok())
}

fn secret_with_fallback<F>(config: &CoreConfig, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    config
        .jobservice_secret
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| lookup(JOBSERVICE_SECRET_ENV).filter(|s| !s.is_empty()))
}

/// Getter interface over the administrative configuration service
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, Value>>;
}

/// Configuration handed in as an already-built map
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    values: HashMap<String, Value>,
}

impl StaticConfigSource {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<HashMap<String, Value>> {
        Ok(self.values.clone())
    }
}

/// JSON object on disk; used by the binary
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<HashMap<String, Value>> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            ReplicationError::Config(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let values: HashMap<String, Value> = serde_json::from_slice(&raw).map_err(|e| {
            ReplicationError::Config(format!("failed to parse {}: {}", self.path.display(), e))
        })?;
        Ok(values)
    }
}
