//! Challenge-driven authorizer dispatch
//!
//! The store pings the registry once, remembers the challenges it answered
//! with and, for each request to that registry, runs every authorizer whose
//! scheme matches one of them.

use crate::common::utils::Endpoint;
use crate::error::{Result, ResultExt};
use crate::registry::auth::Authorizer;
use crate::registry::auth::challenge::{Challenge, parse_challenges};
use crate::registry::auth::credential::BasicAuthCredential;
use crate::registry::auth::generator::PING_TIMEOUT;
use crate::registry::modifier::Modifier;
use async_trait::async_trait;
use reqwest::{Client, Request};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

pub struct AuthorizerStore {
    ping_url: Url,
    challenges: Vec<Challenge>,
    authorizers: Vec<Arc<dyn Authorizer>>,
}

impl AuthorizerStore {
    /// Ping `<endpoint>/v2/` and build a store from the challenges returned.
    pub async fn new(
        endpoint: &Endpoint,
        client: &Client,
        authorizers: Vec<Arc<dyn Authorizer>>,
    ) -> Result<Self> {
        let ping_url = Url::parse(&endpoint.join("/v2/"))?;
        let response = client
            .get(ping_url.clone())
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("pinging {}", ping_url))?;
        let challenges = parse_challenges(response.headers());
        tracing::debug!(
            endpoint = %endpoint,
            challenges = ?challenges.iter().map(|c| c.scheme.as_str()).collect::<Vec<_>>(),
            "registry ping"
        );

        Ok(Self::with_challenges(ping_url, challenges, authorizers))
    }

    pub fn with_challenges(
        ping_url: Url,
        challenges: Vec<Challenge>,
        authorizers: Vec<Arc<dyn Authorizer>>,
    ) -> Self {
        Self {
            ping_url,
            challenges,
            authorizers,
        }
    }

    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    fn covers(&self, url: &Url) -> bool {
        url.scheme() == self.ping_url.scheme()
            && url.host_str() == self.ping_url.host_str()
            && url.port_or_known_default() == self.ping_url.port_or_known_default()
            && url.path().starts_with(self.ping_url.path())
    }
}

#[async_trait]
impl Modifier for AuthorizerStore {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        if !self.covers(request.url()) {
            return Ok(());
        }
        for challenge in &self.challenges {
            for authorizer in &self.authorizers {
                if authorizer.scheme().eq_ignore_ascii_case(&challenge.scheme) {
                    authorizer.authorize(request, &challenge.parameters).await?;
                }
            }
        }
        Ok(())
    }
}

/// Answers `basic` challenges with a fixed username and password
pub struct BasicAuthorizer {
    credential: BasicAuthCredential,
}

impl BasicAuthorizer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credential: BasicAuthCredential::new(username, password),
        }
    }
}

#[async_trait]
impl Modifier for BasicAuthorizer {
    async fn modify(&self, request: &mut Request) -> Result<()> {
        self.credential.modify(request).await
    }
}

#[async_trait]
impl Authorizer for BasicAuthorizer {
    fn scheme(&self) -> &str {
        "basic"
    }

    async fn authorize(&self, request: &mut Request, _parameters: &HashMap<String, String>) -> Result<()> {
        self.credential.modify(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::AUTHORIZATION;

    fn store(scheme: &str) -> AuthorizerStore {
        AuthorizerStore::with_challenges(
            Url::parse("http://registry:5000/v2/").unwrap(),
            vec![Challenge {
                scheme: scheme.to_string(),
                parameters: HashMap::new(),
            }],
            vec![Arc::new(BasicAuthorizer::new("admin", "pw"))],
        )
    }

    fn request(url: &str) -> Request {
        Client::new().get(url).build().unwrap()
    }

    #[tokio::test]
    async fn applies_matching_scheme_to_registry_requests() {
        let store = store("basic");
        let mut req = request("http://registry:5000/v2/library/nginx/tags/list");
        store.modify(&mut req).await.unwrap();
        assert!(req.headers().get(AUTHORIZATION).is_some());
    }

    #[tokio::test]
    async fn ignores_other_hosts_and_schemes() {
        let store = store("basic");
        let mut req = request("http://other:5000/v2/library/nginx/tags/list");
        store.modify(&mut req).await.unwrap();
        assert!(req.headers().get(AUTHORIZATION).is_none());

        let store = self::store("bearer");
        let mut req = request("http://registry:5000/v2/library/nginx/tags/list");
        store.modify(&mut req).await.unwrap();
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }
}
