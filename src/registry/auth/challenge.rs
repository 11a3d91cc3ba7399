//! `WWW-Authenticate` challenge parsing
//!
//! A registry answers an unauthenticated `/v2/` ping with 401 and one
//! challenge per `WWW-Authenticate` header, e.g.
//! `Bearer realm="https://auth.example.com/token",service="registry"`.

use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased auth scheme, e.g. `bearer` or `basic`
    pub scheme: String,
    /// Lowercased parameter names mapped to their unquoted values
    pub parameters: HashMap<String, String>,
}

impl Challenge {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Parse every challenge out of the response headers. Unparseable headers are
/// skipped.
pub fn parse_challenges(headers: &HeaderMap) -> Vec<Challenge> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_challenge)
        .collect()
}

/// Parse a single header value.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = match header.find(char::is_whitespace) {
        Some(pos) => (&header[..pos], &header[pos..]),
        None => (header, ""),
    };
    if scheme.is_empty() {
        return None;
    }

    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        parameters: parse_parameters(rest),
    })
}

fn parse_parameters(input: &str) -> HashMap<String, String> {
    let mut parameters = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',') {
            key.push(c);
        }
        let key = key.trim().to_ascii_lowercase();
        if chars.next_if_eq(&'=').is_none() {
            // A bare token without a value (e.g. token68); nothing to record.
            continue;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
            value = value.trim().to_string();
        }

        if !key.is_empty() {
            parameters.insert(key, value);
        }
    }

    parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn bearer_with_quoted_scope() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#,
        )
        .unwrap();

        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(challenge.parameter("realm"), Some("https://auth.docker.io/token"));
        assert_eq!(challenge.parameter("service"), Some("registry.docker.io"));
        assert_eq!(
            challenge.parameter("scope"),
            Some("repository:library/nginx:pull,push")
        );
    }

    #[test]
    fn unquoted_values_and_odd_spacing() {
        let challenge = parse_challenge(r#"BASIC  Realm = harbor , charset="UTF-8""#).unwrap();
        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.parameter("realm"), Some("harbor"));
        assert_eq!(challenge.parameter("charset"), Some("UTF-8"));
    }

    #[test]
    fn escaped_quotes() {
        let challenge = parse_challenge(r#"Bearer realm="a\"b""#).unwrap();
        assert_eq!(challenge.parameter("realm"), Some("a\"b"));
    }

    #[test]
    fn collects_all_headers() {
        let mut headers = HeaderMap::new();
        headers.append(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Bearer realm="http://h/service/token",service="harbor-registry""#),
        );
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static(r#"Basic realm="h""#));

        let challenges = parse_challenges(&headers);
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "bearer");
        assert_eq!(challenges[1].scheme, "basic");
    }

    #[test]
    fn empty_header_yields_nothing() {
        assert!(parse_challenge("   ").is_none());
    }
}
