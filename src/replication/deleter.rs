//! Replicated deletion of tags or whole repositories on the target

use crate::error::{ReplicationError, Result, ResultExt};
use crate::logging::Logger;
use crate::replication::admin::Deletion;
use crate::replication::factory::ClientFactory;
use crate::replication::{Job, RunOutcome, TargetEndpoint};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DeletionJob {
    pub repository: String,
    /// Empty deletes the whole repository
    pub tags: Vec<String>,
    pub target: TargetEndpoint,
}

/// Removes tags, or a whole repository, from the target.
///
/// Tags are dropped from the pending list as they are deleted, so a run
/// interrupted by a network failure picks up with the remaining ones.
pub struct Deleter {
    job: DeletionJob,
    factory: Arc<ClientFactory>,
    logger: Logger,
    finished: bool,
}

impl Deleter {
    pub fn new(job: DeletionJob, factory: Arc<ClientFactory>, logger: Logger) -> Self {
        Self {
            job,
            factory,
            logger,
            finished: false,
        }
    }

    pub fn pending_tags(&self) -> &[String] {
        &self.job.tags
    }

    async fn delete(&mut self, cancel: &CancellationToken) -> Result<()> {
        let admin = self.factory.target_admin(&self.job.target)?;

        if self.job.tags.is_empty() {
            self.logger
                .info(&format!("deleting repository {} on {}", self.job.repository, admin.endpoint()));
            match admin.delete_repository(&self.job.repository).await? {
                Deletion::Deleted => self.logger.info(&format!("repository {} deleted", self.job.repository)),
                Deletion::NotFound => self
                    .logger
                    .warning(&format!("repository {} not found on target", self.job.repository)),
            }
            return Ok(());
        }

        while let Some(tag) = self.job.tags.first().cloned() {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Canceled);
            }
            self.logger.set_tag(&tag);
            match admin.delete_tag(&self.job.repository, &tag).await? {
                Deletion::Deleted => self
                    .logger
                    .info(&format!("{}:{} deleted", self.job.repository, tag)),
                Deletion::NotFound => self
                    .logger
                    .warning(&format!("{}:{} not found on target, skipping", self.job.repository, tag)),
            }
            self.job.tags.remove(0);
        }
        Ok(())
    }
}

#[async_trait]
impl Job for Deleter {
    fn repository(&self) -> &str {
        &self.job.repository
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<RunOutcome> {
        if self.finished {
            return Ok(RunOutcome::Finished);
        }
        if cancel.is_cancelled() {
            self.logger.warning("job canceled");
            return Err(ReplicationError::Canceled);
        }

        match self.delete(cancel).await {
            Ok(()) => {
                self.finished = true;
                self.logger.info("deletion finished");
                Ok(RunOutcome::Finished)
            }
            Err(err) if err.is_retryable() => {
                self.logger
                    .warning(&format!("deletion failed: {}, waiting for retry", err));
                Ok(RunOutcome::Retrying)
            }
            Err(err) => {
                self.logger.error(&format!("deletion failed: {}", err));
                Err(err).with_context(|| format!("deleting from {}", self.job.repository))
            }
        }
    }
}
