//! Error types for registry and replication operations
//!
//! Every failure the core can produce maps onto one of a handful of kinds:
//! transport-level failures (retryable), HTTP status errors carrying the
//! response body, protocol violations, configuration problems and
//! cancellation. Higher layers wrap errors with breadcrumbs through
//! [`ResultExt`] without losing the kind.

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// DNS, connection refused, reset or timeout at the network level
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response; the body is kept verbatim
    #[error("http status code: {code}, body: {message}")]
    Http { code: u16, message: String },

    /// Malformed challenge, missing realm, unparseable manifest, empty token
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing or invalid configuration, invalid placement, invalid scheme
    #[error("configuration error: {0}")]
    Config(String),

    #[error("job canceled")]
    Canceled,

    /// A stored entity (policy, target, job) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied input that violates a precondition
    #[error("invalid request: {0}")]
    Validation(String),

    /// A worker task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ReplicationError>,
    },
}

impl ReplicationError {
    pub fn http(code: u16, message: impl Into<String>) -> Self {
        ReplicationError::Http {
            code,
            message: message.into(),
        }
    }

    /// The innermost error, looking through any breadcrumbs.
    pub fn root(&self) -> &ReplicationError {
        match self {
            ReplicationError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Only network-level failures are retried; HTTP errors are surfaced
    /// so the dispatcher may decide.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), ReplicationError::Transport(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), ReplicationError::Canceled)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.root() {
            ReplicationError::Http { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 401 or 403 from the remote side: reachable, but the credential was refused.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status_code(), Some(401) | Some(403))
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404) || matches!(self.root(), ReplicationError::NotFound(_))
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::classify(&err)
    }
}

impl From<crate::concurrency::ConcurrencyError> for ReplicationError {
    fn from(err: crate::concurrency::ConcurrencyError) -> Self {
        match err {
            crate::concurrency::ConcurrencyError::Canceled => ReplicationError::Canceled,
            other => ReplicationError::Task(other.to_string()),
        }
    }
}

/// Attach contextual breadcrumbs (repository, tag, digest, direction) to an error.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<ReplicationError>,
{
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|err| ReplicationError::Context {
            context: context.into(),
            source: Box::new(err.into()),
        })
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| ReplicationError::Context {
            context: f().into(),
            source: Box::new(err.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err: Result<()> = Err(ReplicationError::Transport("connection reset".into()));
        let err = err
            .context("pulling blob sha256:abc")
            .context("library/nginx:latest")
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "library/nginx:latest: pulling blob sha256:abc: transport error: connection reset"
        );
    }

    #[test]
    fn http_errors_are_not_retryable() {
        let err = ReplicationError::http(503, "unavailable");
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), Some(503));
        assert!(!err.is_unauthorized());
        assert!(ReplicationError::http(403, "").is_unauthorized());
    }

    #[test]
    fn canceled_is_terminal() {
        let err: Result<()> = Err(ReplicationError::Canceled);
        let err = err.context("transfer").unwrap_err();
        assert!(err.is_canceled());
        assert!(!err.is_retryable());
    }
}
