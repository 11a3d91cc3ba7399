//! SHA256 digest utilities
//!
//! Registries identify manifests and blobs by content digest. When a registry
//! omits `Docker-Content-Digest` on a manifest response the digest is computed
//! from the payload bytes exactly as received.

use crate::error::{ReplicationError, Result};
use crate::image::reference::DIGEST_PATTERN;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static ANCHORED_DIGEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{}$", DIGEST_PATTERN)).expect("digest pattern"));

/// Utilities for working with content digests
pub struct DigestUtils;

impl DigestUtils {
    /// Hex-encoded SHA256 of `data`
    pub fn compute_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// `sha256:<hex>` digest of `data`
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Any `algorithm:hex` digest the distribution grammar accepts
    pub fn is_valid_digest(digest: &str) -> bool {
        ANCHORED_DIGEST.is_match(digest)
    }

    pub fn validate(digest: &str) -> Result<()> {
        if Self::is_valid_digest(digest) {
            Ok(())
        } else {
            Err(ReplicationError::Protocol(format!("invalid digest: {}", digest)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_sha256_of_empty_payload() {
        assert_eq!(
            DigestUtils::compute_docker_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn validates_digest_grammar() {
        assert!(DigestUtils::is_valid_digest(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
        assert!(!DigestUtils::is_valid_digest("sha256:xyz"));
        assert!(!DigestUtils::is_valid_digest("latest"));
        assert!(DigestUtils::validate("md5").is_err());
    }
}
