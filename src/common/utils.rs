//! Endpoint parsing, repository splitting and TCP reachability probing

use crate::error::{ReplicationError, Result};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use url::Url;

/// A registry or service base URL with whitespace and trailing slashes removed.
///
/// A missing scheme defaults to `http`. [`Endpoint::as_str`] never ends with
/// `/`, so paths may be appended directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ReplicationError::Config("empty endpoint".to_string()));
        }

        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };

        let url = Url::parse(&candidate)
            .map_err(|e| ReplicationError::Config(format!("invalid endpoint {}: {}", raw, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ReplicationError::Config(format!(
                    "invalid endpoint {}: unsupported scheme {}",
                    raw, other
                )));
            }
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ReplicationError::Config(format!(
                "invalid endpoint {}: missing host",
                raw
            )));
        }

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Canonical string form, without a trailing slash.
    pub fn as_str(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }

    /// `scheme://host[:port]`, dropping any path.
    pub fn origin(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}://{}:{}", self.url.scheme(), host, port),
            None => format!("{}://{}", self.url.scheme(), host),
        }
    }

    /// Append a path (which should start with `/`) to the endpoint.
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.as_str(), path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an endpoint string into its canonical form.
pub fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    Endpoint::parse(raw)
}

/// Normalize an endpoint to `scheme://host[:port]`.
pub fn format_endpoint(raw: &str) -> Result<String> {
    Ok(Endpoint::parse(raw)?.origin())
}

/// Split `project/name` into the project and the remainder.
///
/// The project is everything before the final `/`; a repository without a
/// slash has no project.
pub fn parse_repository(repository: &str) -> (&str, &str) {
    match repository.rsplit_once('/') {
        Some((project, rest)) => (project, rest),
        None => ("", repository),
    }
}

/// Probe `addr` over TCP until it accepts a connection or `total` elapses.
///
/// Each dial attempt gets a budget of 1, 2, 4… seconds capped by the time
/// left; failed attempts wait `interval` before retrying.
pub async fn test_tcp_conn(addr: &str, total: Duration, interval: Duration) -> Result<()> {
    let deadline = Instant::now() + total;
    let probe = async {
        let mut attempt_budget = Duration::from_secs(1);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = attempt_budget.min(remaining);
            match timeout(budget, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => return,
                Ok(Err(e)) => {
                    tracing::warn!(addr = %addr, error = %e, "tcp probe failed, retrying in {:?}", interval);
                }
                Err(_) => {
                    tracing::warn!(addr = %addr, "tcp probe timed out after {:?}", budget);
                }
            }
            attempt_budget *= 2;
            sleep(interval).await;
        }
    };

    timeout(total, probe).await.map_err(|_| {
        ReplicationError::Transport(format!(
            "failed to connect to tcp:{} after {} seconds",
            addr,
            total.as_secs()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn endpoint_defaults_to_http_and_strips_slashes() {
        let endpoint = parse_endpoint("  registry.example.com:5000/ ").unwrap();
        assert_eq!(endpoint.as_str(), "http://registry.example.com:5000");
        assert_eq!(endpoint.scheme(), "http");

        let endpoint = parse_endpoint("https://registry.example.com/").unwrap();
        assert_eq!(endpoint.to_string(), "https://registry.example.com");
        assert_eq!(endpoint.join("/v2/"), "https://registry.example.com/v2/");
    }

    #[test]
    fn endpoint_keeps_path_prefix() {
        let endpoint = parse_endpoint("https://example.com/registry//").unwrap();
        assert_eq!(endpoint.as_str(), "https://example.com/registry");
        assert_eq!(endpoint.origin(), "https://example.com");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint("   ").is_err());
        assert!(parse_endpoint("ftp://example.com").is_err());
        assert!(parse_endpoint("http://").is_err());
    }

    #[test]
    fn format_endpoint_drops_path() {
        assert_eq!(
            format_endpoint("https://example.com:8443/some/path").unwrap(),
            "https://example.com:8443"
        );
        assert_eq!(format_endpoint("10.0.0.1").unwrap(), "http://10.0.0.1");
    }

    #[test]
    fn repository_split_uses_last_slash() {
        assert_eq!(parse_repository("library/nginx"), ("library", "nginx"));
        assert_eq!(parse_repository("a/b/c"), ("a/b", "c"));
        assert_eq!(parse_repository("nginx"), ("", "nginx"));
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        test_tcp_conn(&addr, Duration::from_secs(2), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tcp_probe_gives_up_after_total() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = std::time::Instant::now();
        let err = test_tcp_conn(&addr, Duration::from_millis(300), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
