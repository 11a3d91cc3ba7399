//! Repository, tag and digest grammar of the distribution API

use crate::error::{ReplicationError, Result};
use regex::Regex;
use std::sync::LazyLock;

/// One or more lowercase path components separated by `/`
pub const NAME_PATTERN: &str = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*)*";

pub const TAG_PATTERN: &str = r"[\w][\w.-]{0,127}";

pub const DIGEST_PATTERN: &str = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";

static ANCHORED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{}$", NAME_PATTERN)).expect("name pattern"));

static ANCHORED_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{}$", TAG_PATTERN)).expect("tag pattern"));

pub fn validate_repository(name: &str) -> Result<()> {
    if name.len() > 255 || !ANCHORED_NAME.is_match(name) {
        return Err(ReplicationError::Validation(format!(
            "invalid repository name: {}",
            name
        )));
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if !ANCHORED_TAG.is_match(tag) {
        return Err(ReplicationError::Validation(format!("invalid tag: {}", tag)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        assert!(validate_repository("library/nginx").is_ok());
        assert!(validate_repository("a/b-c/d__e.f").is_ok());
        assert!(validate_repository("Library/nginx").is_err());
        assert!(validate_repository("library/").is_err());
        assert!(validate_repository("").is_err());
    }

    #[test]
    fn tags() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("1.25.3-alpine").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }
}
