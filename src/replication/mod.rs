//! Replication jobs
//!
//! A [`Transfer`] copies the tags of one repository from the local registry
//! to a remote one; a [`Deleter`] removes tags (or a whole repository) from
//! the remote side. Both are resumable state machines driven by the
//! controller: a run ends `Finished`, asks to be retried, or fails.

pub mod admin;
pub mod deleter;
pub mod factory;
pub mod transfer;

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use admin::{AdminClient, Deletion, Project, ProjectCreation};
pub use deleter::{Deleter, DeletionJob};
pub use factory::ClientFactory;
pub use transfer::{Transfer, TransferJob, TransferState};

pub const USER_AGENT: &str = "harbor-registry-client";

/// The local side of a replication: registry, admin API and internal secret
#[derive(Debug, Clone)]
pub struct SourceEndpoint {
    pub registry_url: String,
    pub admin_url: Option<String>,
    pub secret: String,
    pub insecure: bool,
}

/// The remote side: one URL serving both the registry and the admin API
#[derive(Debug, Clone)]
pub struct TargetEndpoint {
    pub url: String,
    pub username: String,
    pub password: String,
    pub insecure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    /// A network failure interrupted the run; calling `run` again resumes
    /// at the step that failed.
    Retrying,
}

#[async_trait]
pub trait Job: Send {
    fn repository(&self) -> &str;

    async fn run(&mut self, cancel: &CancellationToken) -> Result<RunOutcome>;
}
