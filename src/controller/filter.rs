//! Policy filters: shell-style globs over repository names and tags

use crate::controller::types::{Filter, FilterKind};
use crate::error::{ReplicationError, Result};
use regex::Regex;

/// Compile a glob into an anchored regex. `*` matches any run of
/// characters except `/`, `?` exactly one.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
        .map_err(|e| ReplicationError::Validation(format!("invalid filter pattern {}: {}", pattern, e)))
}

/// The compiled filters of one policy
#[derive(Debug, Default)]
pub struct FilterSet {
    repositories: Vec<Regex>,
    tags: Vec<Regex>,
}

impl FilterSet {
    pub fn compile(filters: &[Filter]) -> Result<Self> {
        let mut set = Self::default();
        for filter in filters {
            let regex = glob_to_regex(&filter.pattern)?;
            match filter.kind {
                FilterKind::Repository => set.repositories.push(regex),
                FilterKind::Tag => set.tags.push(regex),
            }
        }
        Ok(set)
    }

    pub fn has_tag_filters(&self) -> bool {
        !self.tags.is_empty()
    }

    /// A repository passes when any repository filter matches its full
    /// name, or when there are none.
    pub fn matches_repository(&self, repository: &str) -> bool {
        self.repositories.is_empty() || self.repositories.iter().any(|r| r.is_match(repository))
    }

    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tags.is_empty() || self.tags.iter().any(|r| r.is_match(tag))
    }
}
