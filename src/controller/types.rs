//! Policy, target and job records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manual,
    /// Fired by push/delete events in the policy's project
    Immediate,
    /// Fired by the periodic sweep
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Repository,
    Tag,
}

/// Glob over repository names or tags; `*` and `?` never match `/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kind: FilterKind,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    pub id: i64,
    pub name: String,
    /// Project (namespace) whose repositories are replicated
    pub project: String,
    pub target_id: i64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub replicate_deletion: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
}

impl std::fmt::Debug for ReplicationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationTarget")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOperation {
    Transfer,
    Delete,
}

/// Narrows a job to one repository (and optionally some of its tags)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub operation: JobOperation,
    pub repository: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled)
    }
}

/// One `create_job` call: a job per repository
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: String,
    pub policy_id: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub jobs: Vec<String>,
    pub creation_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub execution_id: String,
    pub repository: String,
    pub tags: Vec<String>,
    pub operation: JobOperation,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Filled from the job logger when the record is read
    pub log: Vec<String>,
    pub update_time: DateTime<Utc>,
}

/// What `status` returns for either kind of id
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    Execution(Execution),
    Job(JobRecord),
}

impl StatusReport {
    pub fn status(&self) -> JobStatus {
        match self {
            StatusReport::Execution(e) => e.status,
            StatusReport::Job(j) => j.status,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StatusReport::Execution(e) => e.error.as_deref(),
            StatusReport::Job(j) => j.error.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults() {
        let policy: ReplicationPolicy = serde_json::from_str(
            r#"{"id":1,"name":"p","project":"library","target_id":2}"#,
        )
        .unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.trigger, Trigger::Manual);
        assert!(policy.filters.is_empty());
        assert!(!policy.replicate_deletion);
    }

    #[test]
    fn target_password_is_hidden() {
        let target = ReplicationTarget {
            id: 1,
            name: "remote".to_string(),
            url: "https://remote".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            insecure: false,
        };
        assert!(!format!("{:?}", target).contains("hunter2"));
        assert!(!serde_json::to_string(&target).unwrap().contains("hunter2"));
    }

    #[test]
    fn metadata_wire_format() {
        let metadata: JobMetadata =
            serde_json::from_str(r#"{"operation":"delete","repository":"library/nginx"}"#).unwrap();
        assert_eq!(metadata.operation, JobOperation::Delete);
        assert!(metadata.tags.is_empty());
        assert_eq!(serde_json::to_string(&JobStatus::Retrying).unwrap(), "\"retrying\"");
    }
}
