//! HTTP transports shared by every registry client
//!
//! [`Transports`] owns the three `reqwest::Client` values the process needs:
//! a plain one, one verifying TLS and one that does not. They are built once
//! by the composition root and handed out by clone; each keeps its own
//! connection pool. [`Transport`] layers an ordered modifier chain on top of
//! one of them.

use crate::error::handlers::NetworkErrorHandler;
use crate::error::{ReplicationError, Result};
use crate::registry::modifier::Modifier;
use reqwest::{Client, Request, Response};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Transports {
    default: Client,
    secure: Client,
    insecure: Client,
}

impl Transports {
    pub fn new() -> Result<Self> {
        let default = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build HTTP client: {}", e)))?;
        let secure = Client::builder()
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build HTTP client: {}", e)))?;
        let insecure = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            default,
            secure,
            insecure,
        })
    }

    /// `None` selects the default client, `Some(true)` skips certificate
    /// verification, `Some(false)` verifies.
    pub fn get(&self, insecure: Option<bool>) -> Client {
        match insecure {
            None => self.default.clone(),
            Some(true) => self.insecure.clone(),
            Some(false) => self.secure.clone(),
        }
    }
}

/// An HTTP client plus the modifiers applied to each request it sends
#[derive(Clone)]
pub struct Transport {
    client: Client,
    modifiers: Vec<Arc<dyn Modifier>>,
}

impl Transport {
    pub fn new(client: Client, modifiers: Vec<Arc<dyn Modifier>>) -> Self {
        Self { client, modifiers }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Run every modifier in order, then send. A modifier failure aborts the
    /// request.
    pub async fn round_trip(&self, mut request: Request) -> Result<Response> {
        for modifier in &self.modifiers {
            modifier.modify(&mut request).await?;
        }
        let operation = format!("{} {}", request.method(), request.url());
        self.client
            .execute(request)
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &operation))
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("modifiers", &self.modifiers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Modifier for Recording {
        async fn modify(&self, _request: &mut Request) -> Result<()> {
            self.seen.lock().unwrap().push(self.name);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Modifier for Failing {
        async fn modify(&self, _request: &mut Request) -> Result<()> {
            Err(ReplicationError::Config("no credential".into()))
        }
    }

    #[tokio::test]
    async fn modifier_failure_aborts_before_sending() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transports = Transports::new().unwrap();
        let transport = Transport::new(
            transports.get(None),
            vec![
                Arc::new(Recording { name: "first", seen: seen.clone() }),
                Arc::new(Failing),
                Arc::new(Recording { name: "never", seen: seen.clone() }),
            ],
        );

        // Port 9 (discard) is never contacted because the chain fails first.
        let request = transport
            .client()
            .get("http://127.0.0.1:9/v2/")
            .build()
            .unwrap();
        let err = transport.round_trip(request).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Config(_)));
        assert_eq!(*seen.lock().unwrap(), vec!["first"]);
    }
}
