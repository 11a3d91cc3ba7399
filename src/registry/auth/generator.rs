//! Token generators
//!
//! A generator turns a set of scopes into a bearer token for one registry.
//! [`StandardTokenGenerator`] talks to the token server named by the
//! registry's challenge; [`RawTokenGenerator`] mints tokens in-process.

use crate::error::handlers::HttpErrorHandler;
use crate::error::{ReplicationError, Result, ResultExt};
use crate::registry::auth::challenge::parse_challenges;
use crate::registry::auth::scope::Scope;
use crate::registry::auth::token_manager::{Token, TokenResponse};
use crate::registry::modifier::Modifier;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service name used with a configured internal token service
pub const DEFAULT_SERVICE: &str = "harbor-registry";

#[async_trait]
pub trait TokenGenerator: Send + Sync {
    /// `endpoint` is the registry's `/v2/` base. `Ok(None)` means the
    /// registry needs no token.
    async fn generate(&self, scopes: &[Scope], endpoint: &Url) -> Result<Option<Token>>;

    /// Learn realm/service from a challenge already seen by someone else.
    fn observe_challenge(&self, _parameters: &HashMap<String, String>) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Discovery {
    Unknown,
    NoAuth,
    Bearer { realm: String, service: String },
}

/// Fetches tokens from the registry's token server
pub struct StandardTokenGenerator {
    client: Client,
    credential: Option<Arc<dyn Modifier>>,
    discovery: RwLock<Discovery>,
}

impl StandardTokenGenerator {
    pub fn new(client: Client, credential: Option<Arc<dyn Modifier>>) -> Self {
        Self {
            client,
            credential,
            discovery: RwLock::new(Discovery::Unknown),
        }
    }

    /// Skip discovery and always use `realm`, e.g. an internal token service.
    pub fn with_realm(self, realm: impl Into<String>) -> Self {
        self.set_discovery(Discovery::Bearer {
            realm: realm.into(),
            service: DEFAULT_SERVICE.to_string(),
        });
        self
    }

    fn current(&self) -> Discovery {
        self.discovery
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_discovery(&self, discovery: Discovery) {
        *self
            .discovery
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = discovery;
    }

    fn discovery_from(parameters: &HashMap<String, String>) -> Result<Discovery> {
        let realm = parameters
            .get("realm")
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ReplicationError::Protocol("bearer challenge without realm".to_string()))?;
        Ok(Discovery::Bearer {
            realm: realm.clone(),
            service: parameters.get("service").cloned().unwrap_or_default(),
        })
    }

    /// Ping the registry's `/v2/` base and read the bearer challenge, if any.
    async fn discover(&self, endpoint: &Url) -> Result<Discovery> {
        let ping = if endpoint.path().ends_with("/v2/") {
            endpoint.clone()
        } else {
            endpoint.join("/v2/")?
        };
        let response = self
            .client
            .get(ping.clone())
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("pinging {}", ping))?;

        let challenges = parse_challenges(response.headers());
        match challenges.iter().find(|c| c.scheme == "bearer") {
            Some(challenge) => Self::discovery_from(&challenge.parameters),
            None => Ok(Discovery::NoAuth),
        }
    }
}

#[async_trait]
impl TokenGenerator for StandardTokenGenerator {
    async fn generate(&self, scopes: &[Scope], endpoint: &Url) -> Result<Option<Token>> {
        let discovery = match self.current() {
            Discovery::Unknown => {
                let discovered = self.discover(endpoint).await?;
                self.set_discovery(discovered.clone());
                discovered
            }
            known => known,
        };
        let (realm, service) = match discovery {
            Discovery::Bearer { realm, service } => (realm, service),
            _ => return Ok(None),
        };

        let mut url = Url::parse(&realm)
            .map_err(|e| ReplicationError::Protocol(format!("invalid realm {}: {}", realm, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if !service.is_empty() {
                query.append_pair("service", &service);
            }
            for scope in scopes {
                query.append_pair("scope", &scope.to_string());
            }
        }

        let mut request = self
            .client
            .get(url.clone())
            .timeout(TOKEN_TIMEOUT)
            .build()?;
        if let Some(credential) = &self.credential {
            credential.modify(&mut request).await?;
        }

        let response = self
            .client
            .execute(request)
            .await
            .with_context(|| format!("requesting token from {}", realm))?;
        if response.status() != StatusCode::OK {
            return Err(HttpErrorHandler::from_response(response).await);
        }

        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| ReplicationError::Protocol(format!("invalid token response: {}", e)))?;
        Ok(Some(parsed.into_token()))
    }

    fn observe_challenge(&self, parameters: &HashMap<String, String>) {
        if self.current() != Discovery::Unknown {
            return;
        }
        if let Ok(discovered) = Self::discovery_from(parameters) {
            self.set_discovery(discovered);
        }
    }
}

/// Mints a token for `(service, username, scopes)` without a network call
pub type MintFn = Arc<dyn Fn(&str, &str, &[Scope]) -> Result<Token> + Send + Sync>;

/// Generator backed by an in-process minting function
pub struct RawTokenGenerator {
    service: String,
    username: String,
    mint: MintFn,
}

impl RawTokenGenerator {
    pub fn new(service: impl Into<String>, username: impl Into<String>, mint: MintFn) -> Self {
        Self {
            service: service.into(),
            username: username.into(),
            mint,
        }
    }
}

#[async_trait]
impl TokenGenerator for RawTokenGenerator {
    async fn generate(&self, scopes: &[Scope], _endpoint: &Url) -> Result<Option<Token>> {
        (self.mint)(&self.service, &self.username, scopes).map(Some)
    }
}
