//! Request modifiers
//!
//! A modifier mutates an outgoing request before it is sent: adding
//! credentials, a bearer token, cookies or a user agent. Modifiers run in
//! insertion order and must tolerate running again on the same request.

use crate::error::Result;
use async_trait::async_trait;
use reqwest::Request;
use reqwest::header::{HeaderValue, USER_AGENT};

#[async_trait]
pub trait Modifier: Send + Sync {
    async fn modify(&self, request: &mut Request) -> Result<()>;
}

/// Stamps a fixed `User-Agent` on every request
#[derive(Debug, Clone)]
pub struct UserAgentModifier {
    user_agent: HeaderValue,
}

impl UserAgentModifier {
    pub fn new(user_agent: &'static str) -> Self {
        Self {
            user_agent: HeaderValue::from_static(user_agent),
        }
    }
}

#[async_trait]
impl Modifier for UserAgentModifier {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        request
            .headers_mut()
            .insert(USER_AGENT, self.user_agent.clone());
        Ok(())
    }
}
