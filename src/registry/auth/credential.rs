//! Static credentials applied as request modifiers

use crate::error::{ReplicationError, Result};
use crate::registry::modifier::Modifier;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Request;
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderName, HeaderValue};

/// Prefix of the `Authorization` value used between trusted services
pub const SECRET_PREFIX: &str = "Harbor-Secret ";

/// Name of the cookie carrying the internal service secret
pub const SECRET_COOKIE_NAME: &str = "secret";

fn header_value(value: &str, sensitive: bool) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| ReplicationError::Config(format!("invalid header value: {}", e)))?;
    value.set_sensitive(sensitive);
    Ok(value)
}

/// HTTP basic auth; a no-op when the username is empty
#[derive(Debug, Clone)]
pub struct BasicAuthCredential {
    username: String,
    password: String,
}

impl BasicAuthCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

#[async_trait]
impl Modifier for BasicAuthCredential {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        if self.username.is_empty() {
            return Ok(());
        }
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        let value = header_value(&format!("Basic {}", encoded), true)?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// Adds a cookie to the request, keeping any cookies already present
#[derive(Debug, Clone)]
pub struct CookieCredential {
    name: String,
    value: String,
}

impl CookieCredential {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The internal-secret cookie used for calls into the local instance
    pub fn secret(secret: impl Into<String>) -> Self {
        Self::new(SECRET_COOKIE_NAME, secret)
    }
}

#[async_trait]
impl Modifier for CookieCredential {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        let pair = format!("{}={}", self.name, self.value);
        let combined = match request.headers().get(COOKIE).and_then(|v| v.to_str().ok()) {
            Some(existing) if existing.split("; ").any(|c| c == pair) => return Ok(()),
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, pair),
            _ => pair,
        };
        request
            .headers_mut()
            .insert(COOKIE, header_value(&combined, true)?);
        Ok(())
    }
}

/// `Authorization: Harbor-Secret <secret>`
#[derive(Debug, Clone)]
pub struct SecretHeaderCredential {
    secret: String,
}

impl SecretHeaderCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Modifier for SecretHeaderCredential {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        let value = header_value(&format!("{}{}", SECRET_PREFIX, self.secret), true)?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// An API key placed either in a header or in the query string
#[derive(Debug, Clone)]
pub struct ApiKeyCredential {
    key: String,
    value: String,
    placement: String,
}

impl ApiKeyCredential {
    pub fn new(key: impl Into<String>, value: impl Into<String>, placement: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            placement: placement.into(),
        }
    }
}

#[async_trait]
impl Modifier for ApiKeyCredential {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        match self.placement.as_str() {
            "header" => {
                let name = HeaderName::from_bytes(self.key.as_bytes()).map_err(|e| {
                    ReplicationError::Config(format!("invalid header name {}: {}", self.key, e))
                })?;
                request
                    .headers_mut()
                    .insert(name, header_value(&self.value, true)?);
            }
            "query" => {
                let present = request
                    .url()
                    .query_pairs()
                    .any(|(k, v)| k == self.key.as_str() && v == self.value.as_str());
                if !present {
                    request
                        .url_mut()
                        .query_pairs_mut()
                        .append_pair(&self.key, &self.value);
                }
            }
            other => {
                return Err(ReplicationError::Config(format!(
                    "invalid placement: {}",
                    other
                )));
            }
        }
        Ok(())
    }
}
