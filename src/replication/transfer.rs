//! Tag-by-tag repository transfer
//!
//! ```text
//! Initialize -> Check -> PullManifest -> TransferBlob -> PushManifest
//!                            ^                                |
//!                            +--------------------------------+
//! ```
//!
//! `PullManifest` with no tags left ends in `Finished`. A network failure in
//! any step parks the machine in `Retrying`; the next `run` resumes at the
//! step that failed.

use crate::common::utils::parse_repository;
use crate::error::{ReplicationError, Result, ResultExt};
use crate::image::manifest::{ACCEPTED_MANIFEST_TYPES, Manifest};
use crate::logging::Logger;
use crate::registry::RepositoryClient;
use crate::replication::admin::ProjectCreation;
use crate::replication::factory::ClientFactory;
use crate::replication::{Job, RunOutcome, SourceEndpoint, TargetEndpoint};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Initialize,
    Check,
    PullManifest,
    TransferBlob,
    PushManifest,
    Retrying,
    Finished,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Initialize => "initialize",
            TransferState::Check => "check",
            TransferState::PullManifest => "pull manifest",
            TransferState::TransferBlob => "transfer blob",
            TransferState::PushManifest => "push manifest",
            TransferState::Retrying => "retrying",
            TransferState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// What to replicate and where
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub repository: String,
    /// Empty means every tag the source has
    pub tags: Vec<String>,
    pub source: SourceEndpoint,
    pub target: TargetEndpoint,
}

struct Clients {
    source: RepositoryClient,
    target: RepositoryClient,
}

pub struct Transfer {
    job: TransferJob,
    factory: Arc<ClientFactory>,
    logger: Logger,
    state: TransferState,
    resume: TransferState,
    clients: Option<Clients>,
    manifest: Option<Manifest>,
    digest: String,
    blobs: Vec<String>,
    blob_existence: HashMap<String, bool>,
}

impl Transfer {
    pub fn new(job: TransferJob, factory: Arc<ClientFactory>, logger: Logger) -> Self {
        Self {
            job,
            factory,
            logger,
            state: TransferState::Initialize,
            resume: TransferState::Initialize,
            clients: None,
            manifest: None,
            digest: String::new(),
            blobs: Vec::new(),
            blob_existence: HashMap::new(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Tags not yet replicated, head first
    pub fn pending_tags(&self) -> &[String] {
        &self.job.tags
    }

    fn clients(&self) -> Result<(RepositoryClient, RepositoryClient)> {
        self.clients
            .as_ref()
            .map(|c| (c.source.clone(), c.target.clone()))
            .ok_or_else(|| ReplicationError::Protocol("transfer used before initialization".to_string()))
    }

    async fn initialize(&mut self) -> Result<TransferState> {
        let source = self
            .factory
            .source_repository(&self.job.source, &self.job.repository)
            .await?;
        let target = self
            .factory
            .target_repository(&self.job.target, &self.job.repository)
            .await?;
        self.logger.info(&format!(
            "initialized: source {}, target {}",
            source.endpoint(),
            target.endpoint()
        ));

        if self.job.tags.is_empty() {
            self.job.tags = source.list_tag().await.context("listing source tags")?;
            self.logger
                .info(&format!("tags to replicate: {}", self.job.tags.join(", ")));
        }
        self.clients = Some(Clients { source, target });

        if self.job.tags.is_empty() {
            self.logger.info("no tags to replicate");
            return Ok(TransferState::Finished);
        }
        Ok(TransferState::Check)
    }

    async fn check(&mut self) -> Result<TransferState> {
        let (project, _) = parse_repository(&self.job.repository);
        if project.is_empty() {
            return Err(ReplicationError::Validation(format!(
                "repository {} has no project",
                self.job.repository
            )));
        }

        let public = match self.factory.source_admin(&self.job.source)? {
            Some(admin) => admin
                .get_project(project)
                .await?
                .ok_or_else(|| ReplicationError::NotFound(format!("project {} on source", project)))?
                .is_public(),
            None => {
                self.logger.warning(&format!(
                    "no admin endpoint for the source, creating {} as private",
                    project
                ));
                false
            }
        };

        let target_admin = self.factory.target_admin(&self.job.target)?;
        match target_admin.create_project(project, public).await? {
            ProjectCreation::Created => self
                .logger
                .info(&format!("project {} created on {}", project, target_admin.endpoint())),
            ProjectCreation::AlreadyExists => self
                .logger
                .info(&format!("project {} already exists on {}", project, target_admin.endpoint())),
        }
        Ok(TransferState::PullManifest)
    }

    async fn pull_manifest(&mut self) -> Result<TransferState> {
        let Some(tag) = self.job.tags.first().cloned() else {
            return Ok(TransferState::Finished);
        };
        let (source, target) = self.clients()?;

        self.logger.set_tag(&tag);
        self.logger.info(&format!("pulling manifest of {}:{}", self.job.repository, tag));
        let pulled = source
            .pull_manifest(&tag, &ACCEPTED_MANIFEST_TYPES)
            .await
            .with_context(|| format!("pulling manifest {}:{}", self.job.repository, tag))?;
        let manifest = Manifest::unmarshal(&pulled.media_type, pulled.payload)?;

        self.blobs.clear();
        let mut seen = HashSet::new();
        for descriptor in manifest.references() {
            if !seen.insert(descriptor.digest.as_str()) {
                continue;
            }
            let exists = match self.blob_existence.get(&descriptor.digest) {
                Some(exists) => *exists,
                None => {
                    let exists = target.blob_exist(&descriptor.digest).await?;
                    self.blob_existence.insert(descriptor.digest.clone(), exists);
                    exists
                }
            };
            if exists {
                self.logger
                    .detail(&format!("blob {} already exists on target", descriptor.digest));
            } else {
                self.blobs.push(descriptor.digest.clone());
            }
        }

        self.logger.info(&format!(
            "manifest {} of {}:{} references {} blobs, {} to transfer",
            pulled.digest,
            self.job.repository,
            tag,
            seen.len(),
            self.blobs.len()
        ));
        self.logger.set_digest(&pulled.digest);
        self.manifest = Some(manifest);
        self.digest = pulled.digest;
        Ok(TransferState::TransferBlob)
    }

    async fn transfer_blobs(&mut self, cancel: &CancellationToken) -> Result<TransferState> {
        let (source, target) = self.clients()?;

        while let Some(digest) = self.blobs.first().cloned() {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Canceled);
            }

            self.logger.set_digest(&digest);
            self.logger.info(&format!("transferring blob {}", digest));
            let blob = source
                .pull_blob(&digest)
                .await
                .with_context(|| format!("pulling blob {}", digest))?;
            let size = blob.size();
            target
                .push_blob(&digest, size, blob.into_body())
                .await
                .with_context(|| format!("pushing blob {}", digest))?;
            self.logger
                .info(&format!("blob {} ({} bytes) transferred", digest, size));

            self.blob_existence.insert(digest, true);
            self.blobs.remove(0);
        }
        Ok(TransferState::PushManifest)
    }

    async fn push_manifest(&mut self) -> Result<TransferState> {
        let Some(tag) = self.job.tags.first().cloned() else {
            return Ok(TransferState::Finished);
        };
        let (source, target) = self.clients()?;
        self.logger.set_digest(&self.digest);

        let (_, still_on_source) = source.manifest_exist(&tag).await?;
        if !still_on_source {
            self.logger.warning(&format!(
                "{}:{} no longer exists on source, skipping",
                self.job.repository, tag
            ));
        } else {
            let (target_digest, on_target) = target.manifest_exist(&tag).await?;
            if on_target && target_digest == self.digest {
                self.logger.info(&format!(
                    "{}:{} with digest {} already exists on target, skipping",
                    self.job.repository, tag, self.digest
                ));
            } else {
                let manifest = self.manifest.as_ref().ok_or_else(|| {
                    ReplicationError::Protocol("no manifest pulled for push".to_string())
                })?;
                target
                    .push_manifest(&tag, manifest.media_type(), manifest.payload().clone())
                    .await
                    .with_context(|| format!("pushing manifest {}:{}", self.job.repository, tag))?;
                self.logger
                    .info(&format!("manifest of {}:{} pushed", self.job.repository, tag));
            }
        }

        self.job.tags.remove(0);
        self.manifest = None;
        self.digest.clear();
        self.blobs.clear();
        Ok(TransferState::PullManifest)
    }
}

#[async_trait]
impl Job for Transfer {
    fn repository(&self) -> &str {
        &self.job.repository
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<RunOutcome> {
        loop {
            if cancel.is_cancelled() {
                self.logger.warning("job canceled");
                return Err(ReplicationError::Canceled);
            }

            let current = self.state;
            let step = match current {
                TransferState::Initialize => self.initialize().await,
                TransferState::Check => self.check().await,
                TransferState::PullManifest => self.pull_manifest().await,
                TransferState::TransferBlob => self.transfer_blobs(cancel).await,
                TransferState::PushManifest => self.push_manifest().await,
                TransferState::Retrying => {
                    self.logger.info(&format!("resuming at {}", self.resume));
                    self.state = self.resume;
                    continue;
                }
                TransferState::Finished => {
                    self.logger.info("replication finished");
                    return Ok(RunOutcome::Finished);
                }
            };

            match step {
                Ok(next) => {
                    self.logger.detail(&format!("{} -> {}", current, next));
                    self.logger.set_state(next);
                    self.state = next;
                }
                Err(err) if err.is_retryable() => {
                    self.logger
                        .warning(&format!("{} failed: {}, waiting for retry", current, err));
                    self.resume = current;
                    self.state = TransferState::Retrying;
                    self.logger.set_state(self.state);
                    return Ok(RunOutcome::Retrying);
                }
                Err(err) => {
                    if err.is_canceled() {
                        self.logger.warning("job canceled");
                    } else {
                        self.logger.error(&format!("{} failed: {}", current, err));
                    }
                    return Err(err).with_context(|| format!("replicating {}", self.job.repository));
                }
            }
        }
    }
}
