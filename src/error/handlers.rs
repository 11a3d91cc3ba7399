//! Standardized mapping of client failures and HTTP responses to error kinds

use crate::error::ReplicationError;
use reqwest::Response;

/// Classifies `reqwest` failures into retryable transport errors and the rest.
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Map a client error onto an error kind.
    ///
    /// Connect, timeout, send and body-stream failures are network-level and
    /// therefore retryable. Decode failures mean the peer spoke nonsense, and
    /// builder failures mean we built a bad request.
    pub fn classify(err: &reqwest::Error) -> ReplicationError {
        if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            ReplicationError::Transport(err.to_string())
        } else if err.is_decode() {
            ReplicationError::Protocol(err.to_string())
        } else if err.is_builder() {
            ReplicationError::Config(err.to_string())
        } else if let Some(status) = err.status() {
            ReplicationError::http(status.as_u16(), err.to_string())
        } else {
            ReplicationError::Transport(err.to_string())
        }
    }

    /// Same as [`classify`](Self::classify) with an operation label prefixed.
    pub fn handle_network_error(err: &reqwest::Error, operation: &str) -> ReplicationError {
        ReplicationError::Context {
            context: operation.to_string(),
            source: Box::new(Self::classify(err)),
        }
    }
}

/// Turns non-2xx responses into [`ReplicationError::Http`].
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Consume the response and build an HTTP error carrying code and body.
    pub async fn from_response(response: Response) -> ReplicationError {
        let code = response.status().as_u16();
        match response.text().await {
            Ok(body) => ReplicationError::http(code, body),
            Err(err) => NetworkErrorHandler::classify(&err),
        }
    }

    /// Pass 2xx responses through, convert everything else.
    pub async fn check(response: Response) -> Result<Response, ReplicationError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::from_response(response).await)
        }
    }
}
