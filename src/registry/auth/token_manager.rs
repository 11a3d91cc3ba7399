//! Bearer tokens, the per-scope token cache and the bearer authorizer
//!
//! The authorizer stamps `Authorization: Bearer <token>` on requests bound
//! for the registry it was first used against. Tokens are cached per scope
//! string and evicted lazily once they come within [`LATENCY`] of expiry.

use crate::error::{ReplicationError, Result};
use crate::registry::auth::Authorizer;
use crate::registry::auth::generator::TokenGenerator;
use crate::registry::auth::scope::{Scope, parse_scopes_under};
use crate::registry::modifier::Modifier;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Request;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

/// Seconds shaved off a token's lifetime so it is never used at the edge of expiry
pub const LATENCY: i64 = 10;

/// Lifetime assumed when the token server does not say
pub const DEFAULT_EXPIRES_IN: i64 = 60;

/// Longest lifetime honored from a token server (one day)
pub const MAX_EXPIRES_IN: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub token: String,
    pub expires_in: i64,
    pub issued_at: DateTime<Utc>,
}

impl Token {
    pub fn new(token: impl Into<String>, expires_in: i64, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_in,
            issued_at,
        }
    }

    /// A lifetime that does not fit a timestamp counts as expired.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        Duration::try_seconds(self.expires_in.saturating_sub(LATENCY))
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .is_some_and(|expiry| now < expiry)
    }
}

/// Token server response; some servers answer with `access_token`
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
    issued_at: Option<DateTime<Utc>>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Token {
        Token {
            token: self.token.or(self.access_token).unwrap_or_default(),
            expires_in: self
                .expires_in
                .filter(|e| *e > 0)
                .map_or(DEFAULT_EXPIRES_IN, |e| e.min(MAX_EXPIRES_IN)),
            issued_at: self.issued_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Scope string → token, shared by concurrent requests
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, Token>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a still-valid token, dropping the entry if it has expired.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Token> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.get(key) {
            Some(token) if token.is_valid_at(now) => Some(token.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, token: Token) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, token);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bearer-token authorizer bound to one registry
pub struct BearerAuthorizer {
    /// `scheme://host/.../v2/` of the first registry request seen
    registry_url: Mutex<Option<Url>>,
    generator: Arc<dyn TokenGenerator>,
    cache: TokenCache,
}

impl BearerAuthorizer {
    pub fn new(generator: Arc<dyn TokenGenerator>) -> Self {
        Self {
            registry_url: Mutex::new(None),
            generator,
            cache: TokenCache::new(),
        }
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Bind to the first `/v2/` request and pass through everything that
    /// targets another scheme, host or path prefix.
    fn registry_for(&self, url: &Url) -> Option<Url> {
        let v2_index = url.path().find("/v2/")?;
        let prefix = &url.path()[..v2_index + 4];

        let mut bound = self
            .registry_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let registry = bound.get_or_insert_with(|| {
            let mut base = url.clone();
            base.set_path(prefix);
            base.set_query(None);
            base.set_fragment(None);
            base
        });

        let same_registry = registry.scheme() == url.scheme()
            && registry.host_str() == url.host_str()
            && registry.port_or_known_default() == url.port_or_known_default()
            && registry.path() == prefix;
        same_registry.then(|| registry.clone())
    }
}

#[async_trait]
impl Modifier for BearerAuthorizer {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        let Some(registry) = self.registry_for(request.url()) else {
            return Ok(());
        };

        // Bound path is `<prefix>/v2/`
        let prefix = registry.path().trim_end_matches('/').trim_end_matches("/v2");
        let scopes = parse_scopes_under(request, prefix)?;
        // Multi-scope requests are rare (cross-repo mounts); not worth caching.
        let cacheable = scopes.len() <= 1;
        let key = scopes.first().map(Scope::to_string).unwrap_or_default();

        let cached = if cacheable {
            self.cache.get(&key, Utc::now())
        } else {
            None
        };

        let token = match cached {
            Some(token) => token,
            None => {
                let Some(token) = self.generator.generate(&scopes, &registry).await? else {
                    return Ok(());
                };
                if token.token.is_empty() {
                    return Err(ReplicationError::Protocol(
                        "empty token returned by token server".to_string(),
                    ));
                }
                if cacheable {
                    self.cache.put(key, token.clone());
                }
                token
            }
        };

        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.token))
            .map_err(|e| ReplicationError::Protocol(format!("invalid token: {}", e)))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

#[async_trait]
impl Authorizer for BearerAuthorizer {
    fn scheme(&self) -> &str {
        "bearer"
    }

    async fn authorize(&self, request: &mut Request, parameters: &HashMap<String, String>) -> Result<()> {
        self.generator.observe_challenge(parameters);
        self.modify(request).await
    }
}
