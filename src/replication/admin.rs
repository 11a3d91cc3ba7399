//! Client for the administrative API of a registry instance
//!
//! Only the handful of calls replication needs: project lookup and creation,
//! and repository/tag deletion.

use crate::common::utils::Endpoint;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, ResultExt};
use crate::registry::transport::Transport;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub public: Value,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl Project {
    /// Older servers report `public` as 0/1, newer ones as a metadata string.
    pub fn is_public(&self) -> bool {
        let flag = match &self.public {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_i64().unwrap_or_default() != 0),
            Value::String(s) => Some(s == "true" || s == "1"),
            _ => None,
        };
        flag.or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get("public"))
                .map(|s| s == "true")
        })
        .unwrap_or(false)
    }
}

#[derive(Debug, Serialize)]
struct ProjectRequest<'a> {
    project_name: &'a str,
    public: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectCreation {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct AdminClient {
    endpoint: Endpoint,
    transport: Transport,
}

impl AdminClient {
    pub fn new(endpoint: &str, transport: Transport) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            transport,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn get_project(&self, name: &str) -> Result<Option<Project>> {
        let mut url = Url::parse(&self.endpoint.join("/api/projects"))?;
        url.query_pairs_mut().append_pair("name", name);

        let request = self.transport.client().request(Method::GET, url).build()?;
        let response = self
            .transport
            .round_trip(request)
            .await
            .with_context(|| format!("looking up project {}", name))?;
        let response = HttpErrorHandler::check(response).await?;

        // The lookup is a substring search; keep the exact match only.
        let projects: Option<Vec<Project>> = response.json().await?;
        Ok(projects
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.name == name))
    }

    /// Create the project; a 409 means someone else already did.
    pub async fn create_project(&self, name: &str, public: bool) -> Result<ProjectCreation> {
        let body = ProjectRequest {
            project_name: name,
            public: i32::from(public),
        };
        let request = self
            .transport
            .client()
            .post(self.endpoint.join("/api/projects/"))
            .json(&body)
            .build()?;
        let response = self
            .transport
            .round_trip(request)
            .await
            .with_context(|| format!("creating project {}", name))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(ProjectCreation::Created),
            StatusCode::CONFLICT => Ok(ProjectCreation::AlreadyExists),
            _ => Err(HttpErrorHandler::from_response(response).await)
                .with_context(|| format!("creating project {}", name)),
        }
    }

    /// Delete every tag of `repository`.
    pub async fn delete_repository(&self, repository: &str) -> Result<Deletion> {
        self.delete(&format!("/api/repositories/{}/tags", repository))
            .await
            .with_context(|| format!("deleting repository {}", repository))
    }

    pub async fn delete_tag(&self, repository: &str, tag: &str) -> Result<Deletion> {
        self.delete(&format!("/api/repositories/{}/tags/{}", repository, tag))
            .await
            .with_context(|| format!("deleting {}:{}", repository, tag))
    }

    async fn delete(&self, path: &str) -> Result<Deletion> {
        let request = self
            .transport
            .client()
            .request(Method::DELETE, self.endpoint.join(path))
            .build()?;
        let response = self.transport.round_trip(request).await?;
        match response.status() {
            status if status.is_success() => Ok(Deletion::Deleted),
            StatusCode::NOT_FOUND => Ok(Deletion::NotFound),
            _ => Err(HttpErrorHandler::from_response(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(json: &str) -> Project {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn public_flag_variants() {
        assert!(project(r#"{"name":"a","public":1}"#).is_public());
        assert!(!project(r#"{"name":"a","public":0}"#).is_public());
        assert!(project(r#"{"name":"a","public":true}"#).is_public());
        assert!(project(r#"{"name":"a","metadata":{"public":"true"}}"#).is_public());
        assert!(!project(r#"{"name":"a"}"#).is_public());
    }
}
