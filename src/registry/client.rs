//! Registry-level client: ping and catalog
//!
//! Talks to the registry root (`/v2/`, `/v2/_catalog`). Repository-scoped
//! operations live in [`RepositoryClient`](crate::registry::RepositoryClient).

use crate::common::utils::Endpoint;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, ResultExt};
use crate::registry::auth::generator::PING_TIMEOUT;
use crate::registry::transport::Transport;
use reqwest::header::LINK;
use reqwest::{Method, Request, Response, StatusCode};
use serde::Deserialize;

pub const CATALOG_PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

/// Extract the next-page URL from a `Link` header.
///
/// Only `rel="next"` links are followed. A relative URL is resolved against
/// the endpoint; an absolute one is returned verbatim.
pub fn next_page_url(link: &str, endpoint: &Endpoint) -> Option<String> {
    let link = link.trim();
    if !link.ends_with(r#"rel="next""#) {
        return None;
    }
    let start = link.find('<')?;
    let end = link.find('>')?;
    if end <= start {
        return None;
    }
    resolve_location(endpoint, &link[start + 1..end]).ok()
}

/// Resolve a `Location`/`Link` target returned by the registry.
pub fn resolve_location(endpoint: &Endpoint, location: &str) -> Result<String> {
    if location.contains("://") {
        Ok(location.to_string())
    } else {
        Ok(endpoint.url().join(location)?.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    endpoint: Endpoint,
    transport: Transport,
}

impl RegistryClient {
    pub fn new(endpoint: &str, transport: Transport) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            transport,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> Result<Request> {
        Ok(self.transport.client().request(method, url).build()?)
    }

    pub(crate) async fn send(&self, request: Request) -> Result<Response> {
        self.transport.round_trip(request).await
    }

    /// `GET /v2/`. A 401 or 403 surfaces as an HTTP error the caller can
    /// recognise with `is_unauthorized`.
    pub async fn ping(&self) -> Result<()> {
        let mut request = self.request(Method::GET, &self.endpoint.join("/v2/"))?;
        *request.timeout_mut() = Some(PING_TIMEOUT);
        let response = self
            .send(request)
            .await
            .with_context(|| format!("pinging {}", self.endpoint))?;
        HttpErrorHandler::check(response).await.map(|_| ())
    }

    /// Reachability only: authorization failures count as reachable.
    pub async fn ping_simple(&self) -> Result<()> {
        match self.ping().await {
            Err(err) if err.is_unauthorized() => Ok(()),
            other => other,
        }
    }

    /// Every repository in the registry, following `Link` pagination.
    pub async fn catalog(&self) -> Result<Vec<String>> {
        let mut repositories = Vec::new();
        let mut next = Some(
            self.endpoint
                .join(&format!("/v2/_catalog?n={}", CATALOG_PAGE_SIZE)),
        );

        while let Some(url) = next.take() {
            let request = self.request(Method::GET, &url)?;
            let response = self.send(request).await.context("listing catalog")?;
            if response.status() != StatusCode::OK {
                return Err(HttpErrorHandler::from_response(response).await);
            }

            next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(|link| next_page_url(link, &self.endpoint));

            let page: CatalogPage = response.json().await?;
            repositories.extend(page.repositories);
        }

        Ok(repositories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_relative_next_links() {
        let endpoint = Endpoint::parse("http://registry:5000").unwrap();
        assert_eq!(
            next_page_url(r#"</v2/_catalog?last=r999&n=1000>; rel="next""#, &endpoint).as_deref(),
            Some("http://registry:5000/v2/_catalog?last=r999&n=1000")
        );
    }

    #[test]
    fn keeps_absolute_next_links() {
        let endpoint = Endpoint::parse("http://registry:5000").unwrap();
        assert_eq!(
            next_page_url(
                r#"<https://mirror/v2/_catalog?last=a&n=1000>; rel="next""#,
                &endpoint
            )
            .as_deref(),
            Some("https://mirror/v2/_catalog?last=a&n=1000")
        );
    }

    #[test]
    fn ignores_other_relations() {
        let endpoint = Endpoint::parse("http://registry:5000").unwrap();
        assert!(next_page_url(r#"</v2/_catalog?last=a>; rel="prev""#, &endpoint).is_none());
        assert!(next_page_url(r#"rel="next""#, &endpoint).is_none());
    }
}
