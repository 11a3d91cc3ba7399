//! Token scopes and their inference from request paths

use crate::error::{ReplicationError, Result};
use crate::image::reference::{DIGEST_PATTERN, NAME_PATTERN, TAG_PATTERN};
use regex::Regex;
use reqwest::{Method, Request};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

const UUID_PATTERN: &str = r"[0-9a-fA-F-]+";

static TAG_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^/v2/({})/tags/list$", NAME_PATTERN)).expect("tag list pattern")
});

static MANIFEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^/v2/({})/manifests/(?:{}|{})$",
        NAME_PATTERN, TAG_PATTERN, DIGEST_PATTERN
    ))
    .expect("manifest pattern")
});

static BLOB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^/v2/({})/blobs/{}$", NAME_PATTERN, DIGEST_PATTERN)).expect("blob pattern")
});

static BLOB_UPLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^/v2/({})/blobs/uploads$", NAME_PATTERN)).expect("blob upload pattern")
});

static BLOB_UPLOAD_CHUNK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^/v2/({})/blobs/uploads/{}$", NAME_PATTERN, UUID_PATTERN))
        .expect("blob upload chunk pattern")
});

static CATALOG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^/v2/_catalog$").expect("catalog pattern"));

static BASE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^/v2$").expect("base pattern"));

/// A resource-action triple, rendered as `type:name:action1,action2`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl Scope {
    pub fn new(resource_type: &str, name: &str, actions: &[&str]) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn repository(name: &str, actions: &[&str]) -> Self {
        Self::new("repository", name, actions)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type,
            self.name,
            self.actions.join(",")
        )
    }
}

impl FromStr for Scope {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ReplicationError::Protocol(format!("invalid scope: {}", s));
        let (resource_type, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (name, actions) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if resource_type.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            actions: actions
                .split(',')
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

fn repository_in(path: &str) -> Option<String> {
    [&*TAG_LIST, &*MANIFEST, &*BLOB, &*BLOB_UPLOAD, &*BLOB_UPLOAD_CHUNK]
        .iter()
        .find_map(|re| re.captures(path))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Infer the scopes a request needs from its method, path and query.
///
/// A `from` query parameter (cross-repository mount) adds a pull scope on the
/// source repository. A path that does not start with `/v2/`, or is neither a
/// known repository endpoint, the catalog nor the base, is an error.
pub fn parse_scopes(request: &Request) -> Result<Vec<Scope>> {
    parse_scopes_under(request, "")
}

/// [`parse_scopes`] for a registry served below `prefix` (e.g. `/registry`).
pub fn parse_scopes_under(request: &Request, prefix: &str) -> Result<Vec<Scope>> {
    let full_path = request.url().path();
    let Some(path) = full_path.strip_prefix(prefix.trim_end_matches('/')) else {
        return Err(ReplicationError::Protocol(format!(
            "path {} is outside registry prefix {}",
            full_path, prefix
        )));
    };
    let path = path.trim_end_matches('/');

    let mut scopes = Vec::new();

    if let Some((_, from)) = request
        .url()
        .query_pairs()
        .find(|(k, v)| k == "from" && !v.is_empty())
    {
        scopes.push(Scope::repository(&from, &["pull"]));
    }

    if let Some(repository) = repository_in(path) {
        let method = request.method();
        let actions: &[&str] = if *method == Method::GET || *method == Method::HEAD {
            &["pull"]
        } else if *method == Method::POST || *method == Method::PUT || *method == Method::PATCH {
            &["pull", "push"]
        } else if *method == Method::DELETE {
            &["*"]
        } else {
            tracing::warn!(method = %method, path = %path, "unsupported method, no scope inferred");
            return Ok(scopes);
        };
        scopes.push(Scope::repository(&repository, actions));
    } else if CATALOG.is_match(path) {
        scopes.push(Scope::new("registry", "catalog", &["*"]));
    } else if BASE.is_match(path) {
        // the ping endpoint needs no scope
    } else {
        return Err(ReplicationError::Protocol(format!(
            "failed to parse scope from path: {}",
            path
        )));
    }

    Ok(scopes)
}
