//! Replication controller
//!
//! Turns a policy into an execution: the repositories (and tags) the policy
//! selects become one job each, dispatched through a [`Runner`] bounded by
//! the configured worker count. Jobs that ask to be retried are re-run after
//! a pause, a bounded number of times. Every execution and job is tracked
//! in memory and can be queried or canceled by id.

pub mod api;
pub mod filter;
pub mod store;
pub mod types;

pub use filter::FilterSet;
pub use store::{InMemoryPolicyStore, InMemoryTargetStore, PolicyStore, TargetStore};
pub use types::{
    Execution, Filter, FilterKind, JobMetadata, JobOperation, JobRecord, JobStatus,
    ReplicationPolicy, ReplicationTarget, StatusReport, Trigger,
};

use crate::concurrency::runner::Runner;
use crate::config::{CoreConfig, jobservice_secret};
use crate::error::{ReplicationError, Result};
use crate::image::reference::{validate_repository, validate_tag};
use crate::logging::Logger;
use crate::replication::{
    ClientFactory, Deleter, DeletionJob, Job, RunOutcome, SourceEndpoint, TargetEndpoint,
    Transfer, TransferJob,
};
use crate::scheduler::{InMemoryWatchItemDao, Markers, WatchItem, WatchItemDao, WatchOperation};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// How long finished executions stay queryable
pub const DEFAULT_RECORD_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Repositories whose tags are listed concurrently while expanding tag filters
const TAG_LISTING_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub source: SourceEndpoint,
    pub max_job_workers: usize,
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Terminal executions older than this are dropped by [`Controller::prune`]
    pub record_retention: Duration,
    /// When false every target is reached without certificate checks
    pub verify_remote_cert: bool,
}

impl ControllerSettings {
    pub fn new(source: SourceEndpoint) -> Self {
        Self {
            source,
            max_job_workers: 3,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            record_retention: DEFAULT_RECORD_RETENTION,
            verify_remote_cert: true,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let secret = jobservice_secret(config)
            .ok_or_else(|| ReplicationError::Config("jobservice_secret is not configured".to_string()))?;
        let source = SourceEndpoint {
            registry_url: config.registry_url()?.to_string(),
            admin_url: config.ui_url.clone(),
            secret,
            insecure: false,
        };
        Ok(Self {
            max_job_workers: config.max_job_workers,
            verify_remote_cert: config.verify_remote_cert,
            ..Self::new(source)
        })
    }
}

/// A repository selected for replication, before it gets an id
#[derive(Debug, Clone)]
struct PlannedJob {
    operation: JobOperation,
    repository: String,
    tags: Vec<String>,
}

struct ExecutionEntry {
    record: Execution,
    cancel: CancellationToken,
}

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
    logger: Logger,
}

#[derive(Default)]
struct Records {
    executions: HashMap<String, ExecutionEntry>,
    jobs: HashMap<String, JobEntry>,
}

struct Inner {
    settings: ControllerSettings,
    factory: Arc<ClientFactory>,
    policies: Arc<dyn PolicyStore>,
    targets: Arc<dyn TargetStore>,
    watch_items: Arc<dyn WatchItemDao>,
    markers: Arc<Markers>,
    records: Mutex<Records>,
    shutdown: CancellationToken,
}

pub struct ControllerBuilder {
    settings: ControllerSettings,
    factory: Arc<ClientFactory>,
    policies: Option<Arc<dyn PolicyStore>>,
    targets: Option<Arc<dyn TargetStore>>,
    watch_items: Option<Arc<dyn WatchItemDao>>,
    markers: Option<Arc<Markers>>,
}

impl ControllerBuilder {
    pub fn policies(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policies = Some(store);
        self
    }

    pub fn targets(mut self, store: Arc<dyn TargetStore>) -> Self {
        self.targets = Some(store);
        self
    }

    pub fn watch_items(mut self, dao: Arc<dyn WatchItemDao>) -> Self {
        self.watch_items = Some(dao);
        self
    }

    pub fn markers(mut self, markers: Arc<Markers>) -> Self {
        self.markers = Some(markers);
        self
    }

    pub fn build(self) -> Controller {
        Controller {
            inner: Arc::new(Inner {
                settings: self.settings,
                factory: self.factory,
                policies: self.policies.unwrap_or_else(|| Arc::new(InMemoryPolicyStore::new())),
                targets: self.targets.unwrap_or_else(|| Arc::new(InMemoryTargetStore::new())),
                watch_items: self
                    .watch_items
                    .unwrap_or_else(|| Arc::new(InMemoryWatchItemDao::new())),
                markers: self.markers.unwrap_or_default(),
                records: Mutex::new(Records::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn builder(settings: ControllerSettings, factory: Arc<ClientFactory>) -> ControllerBuilder {
        ControllerBuilder {
            settings,
            factory,
            policies: None,
            targets: None,
            watch_items: None,
            markers: None,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }

    /// Store a policy; an immediate trigger starts watching its project.
    pub async fn register_policy(&self, policy: ReplicationPolicy) -> Result<()> {
        FilterSet::compile(&policy.filters)?;
        self.inner.watch_items.delete_by_policy_id(policy.id).await?;
        if policy.trigger == Trigger::Immediate {
            let item = WatchItem::new(policy.id, policy.project.clone(), true, policy.replicate_deletion);
            self.inner.watch_items.add(item).await?;
        }
        info!(policy = policy.id, name = %policy.name, trigger = ?policy.trigger, "policy registered");
        self.inner.policies.save(policy).await
    }

    pub async fn remove_policy(&self, policy_id: i64) -> Result<()> {
        self.inner.watch_items.delete_by_policy_id(policy_id).await?;
        self.inner.policies.delete(policy_id).await
    }

    pub async fn register_target(&self, target: ReplicationTarget) -> Result<()> {
        self.inner.targets.save(target).await
    }

    /// Start an execution of `policy_id` and return its id.
    ///
    /// Without metadata the policy's project is expanded through the source
    /// catalog and the policy filters. With metadata exactly one job runs.
    pub async fn create_job(&self, policy_id: i64, metadata: Option<JobMetadata>) -> Result<String> {
        let policy = self
            .inner
            .policies
            .get(policy_id)
            .await?
            .ok_or_else(|| ReplicationError::NotFound(format!("policy {}", policy_id)))?;
        if !policy.enabled {
            return Err(ReplicationError::Validation(format!("policy {} is disabled", policy_id)));
        }
        let target = self
            .inner
            .targets
            .get(policy.target_id)
            .await?
            .ok_or_else(|| ReplicationError::NotFound(format!("target {}", policy.target_id)))?;

        let planned = match metadata {
            Some(metadata) => vec![plan_from_metadata(&policy, metadata)?],
            None => self.plan_from_policy(&policy).await?,
        };

        let target = TargetEndpoint {
            url: target.url,
            username: target.username,
            password: target.password,
            insecure: target.insecure || !self.inner.settings.verify_remote_cert,
        };

        let execution_id = Uuid::new_v4().to_string();
        let execution_cancel = self.inner.shutdown.child_token();
        let now = Utc::now();
        let mut jobs = Vec::with_capacity(planned.len());
        {
            let mut records = self.inner.records();
            for job in planned {
                let job_id = Uuid::new_v4().to_string();
                let record = JobRecord {
                    id: job_id.clone(),
                    execution_id: execution_id.clone(),
                    repository: job.repository.clone(),
                    tags: job.tags.clone(),
                    operation: job.operation,
                    status: JobStatus::Pending,
                    error: None,
                    log: Vec::new(),
                    update_time: now,
                };
                records.jobs.insert(
                    job_id.clone(),
                    JobEntry {
                        record,
                        cancel: execution_cancel.child_token(),
                        logger: Logger::new(&job_id, &job.repository),
                    },
                );
                jobs.push((job_id, job));
            }
            records.executions.insert(
                execution_id.clone(),
                ExecutionEntry {
                    record: Execution {
                        id: execution_id.clone(),
                        policy_id,
                        status: JobStatus::Pending,
                        error: None,
                        jobs: jobs.iter().map(|(id, _)| id.clone()).collect(),
                        creation_time: now,
                        update_time: now,
                    },
                    cancel: execution_cancel.clone(),
                },
            );
        }

        info!(execution = %execution_id, policy = policy_id, jobs = jobs.len(), "execution created");
        tokio::spawn(
            self.inner
                .clone()
                .run_execution(execution_id.clone(), execution_cancel, target, jobs),
        );
        Ok(execution_id)
    }

    async fn plan_from_policy(&self, policy: &ReplicationPolicy) -> Result<Vec<PlannedJob>> {
        let filters = FilterSet::compile(&policy.filters)?;
        let source = &self.inner.settings.source;
        let factory = &self.inner.factory;

        let prefix = format!("{}/", policy.project);
        let registry = factory.source_registry(source).await?;
        let repositories: Vec<String> = registry
            .catalog()
            .await?
            .into_iter()
            .filter(|repository| repository.starts_with(&prefix) && filters.matches_repository(repository))
            .collect();
        debug!(policy = policy.id, repositories = repositories.len(), "catalog filtered");

        if !filters.has_tag_filters() {
            return Ok(repositories
                .into_iter()
                .map(|repository| PlannedJob {
                    operation: JobOperation::Transfer,
                    repository,
                    tags: Vec::new(),
                })
                .collect());
        }

        let filters = &filters;
        let planned: Vec<Option<PlannedJob>> = stream::iter(repositories)
            .map(|repository| async move {
                let client = factory.source_repository(source, &repository).await?;
                let tags: Vec<String> = client
                    .list_tag()
                    .await?
                    .into_iter()
                    .filter(|tag| filters.matches_tag(tag))
                    .collect();
                Ok::<_, ReplicationError>((!tags.is_empty()).then(|| PlannedJob {
                    operation: JobOperation::Transfer,
                    repository,
                    tags,
                }))
            })
            .buffered(TAG_LISTING_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(planned.into_iter().flatten().collect())
    }

    /// Signal cancellation. Returns false when the record already reached a
    /// terminal state.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let records = self.inner.records();
        let (status, token) = if let Some(execution) = records.executions.get(id) {
            (execution.record.status, &execution.cancel)
        } else if let Some(job) = records.jobs.get(id) {
            (job.record.status, &job.cancel)
        } else {
            return Err(ReplicationError::NotFound(format!("job {}", id)));
        };
        if status.is_terminal() {
            return Ok(false);
        }
        token.cancel();
        info!(id = %id, "cancellation requested");
        Ok(true)
    }

    /// Current state of an execution or a single job.
    pub fn status(&self, id: &str) -> Result<StatusReport> {
        let records = self.inner.records();
        if let Some(execution) = records.executions.get(id) {
            return Ok(StatusReport::Execution(execution.record.clone()));
        }
        if let Some(job) = records.jobs.get(id) {
            let mut record = job.record.clone();
            record.log = job.logger.lines();
            return Ok(StatusReport::Job(record));
        }
        Err(ReplicationError::NotFound(format!("job {}", id)))
    }

    /// React to a push or delete in `namespace`: every immediate policy
    /// watching it gets a single-repository execution.
    pub async fn on_event(
        &self,
        namespace: &str,
        repository: &str,
        tags: &[String],
        operation: WatchOperation,
    ) -> Result<Vec<String>> {
        let items = self.inner.watch_items.get(namespace, operation).await?;
        let job_operation = match operation {
            WatchOperation::Push => JobOperation::Transfer,
            WatchOperation::Delete => JobOperation::Delete,
        };

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let metadata = JobMetadata {
                operation: job_operation,
                repository: repository.to_string(),
                tags: tags.to_vec(),
            };
            match self.create_job(item.policy_id, Some(metadata)).await {
                Ok(id) => ids.push(id),
                Err(err) => warn!(policy = item.policy_id, repository, error = %err, "event not replicated"),
            }
        }
        Ok(ids)
    }

    /// Run every enabled scheduled policy, at most once per sweep interval.
    ///
    /// A policy whose previous execution is still running is skipped.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        self.prune();
        if !self.inner.markers.replication_sweep.try_mark() {
            debug!("replication sweep skipped, interval not elapsed");
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for policy in self.inner.policies.list().await? {
            if !policy.enabled || policy.trigger != Trigger::Scheduled {
                continue;
            }
            if self.inner.has_active_execution(policy.id) {
                debug!(policy = policy.id, "previous execution still running, skipped");
                continue;
            }
            match self.create_job(policy.id, None).await {
                Ok(id) => ids.push(id),
                Err(err) => warn!(policy = policy.id, error = %err, "scheduled replication not started"),
            }
        }
        Ok(ids)
    }

    /// Drop terminal executions, and their jobs, last updated before the
    /// retention window. Returns how many executions were dropped.
    pub fn prune(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.inner.settings.record_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut records = self.inner.records();
        let Records { executions, jobs } = &mut *records;
        let before = executions.len();
        executions.retain(|_, execution| {
            let expired = execution.record.status.is_terminal() && execution.record.update_time <= cutoff;
            if expired {
                for job_id in &execution.record.jobs {
                    jobs.remove(job_id);
                }
            }
            !expired
        });

        let pruned = before - executions.len();
        if pruned > 0 {
            debug!(pruned, remaining = executions.len(), "execution records pruned");
        }
        pruned
    }

    /// Call [`Controller::sweep`] on every tick until shutdown.
    pub async fn run_scheduler(&self) {
        let mut ticker = tokio::time::interval(self.inner.markers.replication_sweep.interval());
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(error = %err, "replication sweep failed");
                    }
                }
            }
        }
    }

    /// Cancel every running execution and stop the scheduler.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn plan_from_metadata(policy: &ReplicationPolicy, metadata: JobMetadata) -> Result<PlannedJob> {
    if metadata.operation == JobOperation::Delete && !policy.replicate_deletion {
        return Err(ReplicationError::Validation(format!(
            "policy {} does not replicate deletions",
            policy.id
        )));
    }

    let repository = metadata.repository.trim().to_string();
    validate_repository(&repository)?;
    if !repository.starts_with(&format!("{}/", policy.project)) {
        return Err(ReplicationError::Validation(format!(
            "repository {} is not in project {}",
            repository, policy.project
        )));
    }
    for tag in &metadata.tags {
        validate_tag(tag)?;
    }

    Ok(PlannedJob {
        operation: metadata.operation,
        repository,
        tags: metadata.tags,
    })
}

impl Inner {
    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn has_active_execution(&self, policy_id: i64) -> bool {
        self.records()
            .executions
            .values()
            .any(|execution| execution.record.policy_id == policy_id && !execution.record.status.is_terminal())
    }

    fn set_execution_status(&self, id: &str, status: JobStatus, error: Option<String>) {
        if let Some(execution) = self.records().executions.get_mut(id) {
            execution.record.status = status;
            execution.record.error = error;
            execution.record.update_time = Utc::now();
        }
    }

    fn set_job_status(&self, id: &str, status: JobStatus, error: Option<String>) {
        if let Some(job) = self.records().jobs.get_mut(id) {
            job.record.status = status;
            job.record.error = error;
            job.record.update_time = Utc::now();
        }
    }

    fn job_handles(&self, id: &str) -> Option<(CancellationToken, Logger)> {
        self.records()
            .jobs
            .get(id)
            .map(|job| (job.cancel.clone(), job.logger.clone()))
    }

    async fn run_execution(
        self: Arc<Self>,
        id: String,
        cancel: CancellationToken,
        target: TargetEndpoint,
        jobs: Vec<(String, PlannedJob)>,
    ) {
        self.set_execution_status(&id, JobStatus::Running, None);

        let mut runner = Runner::with_parent(self.settings.max_job_workers, &cancel);
        for (job_id, planned) in jobs {
            let inner = self.clone();
            let target = target.clone();
            runner.add_task(move |runner_cancel| async move {
                inner.run_job(&job_id, planned, target, runner_cancel).await
            });
        }
        let result = runner.wait().await;

        let mut records = self.records();
        let Records { executions, jobs } = &mut *records;
        let Some(execution) = executions.get_mut(&id) else {
            return;
        };

        let mut canceled = false;
        for job_id in &execution.record.jobs {
            if let Some(job) = jobs.get_mut(job_id) {
                // Jobs the runner never started
                if !job.record.status.is_terminal() {
                    job.record.status = JobStatus::Canceled;
                    job.record.update_time = Utc::now();
                }
                canceled |= job.record.status == JobStatus::Canceled;
            }
        }

        let (status, error) = match result {
            Err(err) => (JobStatus::Failed, Some(err.to_string())),
            Ok(()) if canceled => (JobStatus::Canceled, None),
            Ok(()) => (JobStatus::Finished, None),
        };
        execution.record.status = status;
        execution.record.error = error;
        execution.record.update_time = Utc::now();
        info!(execution = %id, status = ?status, "execution done");
    }

    /// Drive one job to completion. Only a failure is reported to the
    /// runner; cancellation ends the job quietly.
    async fn run_job(
        &self,
        id: &str,
        planned: PlannedJob,
        target: TargetEndpoint,
        runner_cancel: CancellationToken,
    ) -> Result<()> {
        let Some((job_cancel, logger)) = self.job_handles(id) else {
            return Ok(());
        };
        if job_cancel.is_cancelled() || runner_cancel.is_cancelled() {
            self.set_job_status(id, JobStatus::Canceled, None);
            return Ok(());
        }

        // Canceled by its own stop request, its execution, or a failing sibling.
        let cancel = job_cancel.child_token();
        let _cancel_guard = cancel.clone().drop_guard();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = runner_cancel.cancelled() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            }
        });

        let mut job: Box<dyn Job> = match planned.operation {
            JobOperation::Transfer => Box::new(Transfer::new(
                TransferJob {
                    repository: planned.repository,
                    tags: planned.tags,
                    source: self.settings.source.clone(),
                    target,
                },
                self.factory.clone(),
                logger,
            )),
            JobOperation::Delete => Box::new(Deleter::new(
                DeletionJob {
                    repository: planned.repository,
                    tags: planned.tags,
                    target,
                },
                self.factory.clone(),
                logger,
            )),
        };
        self.set_job_status(id, JobStatus::Running, None);

        let mut retries = 0;
        loop {
            match job.run(&cancel).await {
                Ok(RunOutcome::Finished) => {
                    self.set_job_status(id, JobStatus::Finished, None);
                    return Ok(());
                }
                Ok(RunOutcome::Retrying) => {
                    if retries >= self.settings.max_retries {
                        let err = ReplicationError::Task(format!(
                            "{} still failing after {} retries",
                            job.repository(),
                            retries
                        ));
                        self.set_job_status(id, JobStatus::Failed, Some(err.to_string()));
                        return Err(err);
                    }
                    retries += 1;
                    self.set_job_status(id, JobStatus::Retrying, None);
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.retry_interval) => {}
                        _ = cancel.cancelled() => {
                            self.set_job_status(id, JobStatus::Canceled, None);
                            return Ok(());
                        }
                    }
                    self.set_job_status(id, JobStatus::Running, None);
                }
                Err(err) if err.is_canceled() => {
                    self.set_job_status(id, JobStatus::Canceled, None);
                    return Ok(());
                }
                Err(err) => {
                    self.set_job_status(id, JobStatus::Failed, Some(err.to_string()));
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReplicationPolicy {
        ReplicationPolicy {
            id: 1,
            name: "to-remote".to_string(),
            project: "library".to_string(),
            target_id: 1,
            enabled: true,
            trigger: Trigger::Manual,
            filters: Vec::new(),
            replicate_deletion: false,
        }
    }

    fn metadata(operation: JobOperation, repository: &str, tags: &[&str]) -> JobMetadata {
        JobMetadata {
            operation,
            repository: repository.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn metadata_must_stay_in_project() {
        let err = plan_from_metadata(&policy(), metadata(JobOperation::Transfer, "other/nginx", &[]))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Validation(_)));

        let job = plan_from_metadata(&policy(), metadata(JobOperation::Transfer, " library/nginx ", &["1.25"]))
            .unwrap();
        assert_eq!(job.repository, "library/nginx");
        assert_eq!(job.tags, vec!["1.25"]);
    }

    #[test]
    fn delete_needs_replicate_deletion() {
        let err = plan_from_metadata(&policy(), metadata(JobOperation::Delete, "library/nginx", &[]))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Validation(_)));

        let mut policy = policy();
        policy.replicate_deletion = true;
        assert!(plan_from_metadata(&policy, metadata(JobOperation::Delete, "library/nginx", &[])).is_ok());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(plan_from_metadata(&policy(), metadata(JobOperation::Transfer, "library/NGINX", &[])).is_err());
        assert!(plan_from_metadata(&policy(), metadata(JobOperation::Transfer, "library/nginx", &[".bad"])).is_err());
    }
}
