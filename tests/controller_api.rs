//! Job API and controller, driven through the router

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use registry_replicator::controller::api::create_router;
use registry_replicator::controller::{
    Controller, ControllerSettings, Filter, FilterKind, JobMetadata, JobOperation, JobStatus,
    ReplicationPolicy, ReplicationTarget, StatusReport, Trigger,
};
use registry_replicator::registry::Transports;
use registry_replicator::replication::{ClientFactory, SourceEndpoint};
use registry_replicator::scheduler::{Markers, WatchOperation};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "s3cr3t";

fn settings(registry_url: &str) -> ControllerSettings {
    let mut settings = ControllerSettings::new(SourceEndpoint {
        registry_url: registry_url.to_string(),
        admin_url: None,
        secret: SECRET.to_string(),
        insecure: false,
    });
    settings.max_retries = 0;
    settings.retry_interval = Duration::from_millis(10);
    settings
}

async fn controller(registry_url: &str, target_url: &str) -> Controller {
    let factory = Arc::new(ClientFactory::new(Transports::new().unwrap()));
    let controller = Controller::builder(settings(registry_url), factory).build();
    with_target(controller, target_url).await
}

async fn with_target(controller: Controller, target_url: &str) -> Controller {
    controller
        .register_target(ReplicationTarget {
            id: 1,
            name: "remote".to_string(),
            url: target_url.to_string(),
            username: "admin".to_string(),
            password: "Harbor12345".to_string(),
            insecure: false,
        })
        .await
        .unwrap();
    controller
}

fn policy(id: i64) -> ReplicationPolicy {
    ReplicationPolicy {
        id,
        name: format!("policy-{}", id),
        project: "library".to_string(),
        target_id: 1,
        enabled: true,
        trigger: Trigger::Manual,
        filters: Vec::new(),
        replicate_deletion: true,
    }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>, secret: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(secret) = secret {
        builder = builder.header("Authorization", format!("Harbor-Secret {}", secret));
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, json)
}

fn delete_tag(tag: &str) -> JobMetadata {
    JobMetadata {
        operation: JobOperation::Delete,
        repository: "library/hello".to_string(),
        tags: vec![tag.to_string()],
    }
}

fn first_job(controller: &Controller, execution_id: &str) -> String {
    let StatusReport::Execution(execution) = controller.status(execution_id).unwrap() else {
        panic!("expected an execution");
    };
    execution.jobs[0].clone()
}

async fn wait_for_terminal(controller: &Controller, id: &str) -> StatusReport {
    for _ in 0..200 {
        let report = controller.status(id).unwrap();
        if report.status().is_terminal() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} did not finish", id);
}

#[tokio::test]
async fn ping_needs_no_secret() {
    let controller = controller("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let router = create_router(controller, SECRET);

    let (status, body) = call(&router, "GET", "/api/ping", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn job_routes_require_the_secret() {
    let controller = controller("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let router = create_router(controller, SECRET);

    let (status, body) = call(&router, "POST", "/api/jobs/replication", Some(json!({"policy_id": 1})), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = call(&router, "GET", "/api/jobs/replication/abc", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_and_disabled_policies_are_rejected() {
    let controller = controller("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let mut disabled = policy(2);
    disabled.enabled = false;
    controller.register_policy(disabled).await.unwrap();
    let router = create_router(controller, SECRET);

    let (status, body) = call(&router, "POST", "/api/jobs/replication", Some(json!({"policy_id": 9})), Some(SECRET)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = call(&router, "POST", "/api/jobs/replication", Some(json!({"policy_id": 2})), Some(SECRET)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&router, "GET", "/api/jobs/replication/nope", None, Some(SECRET)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deletion_job_runs_to_completion() {
    let target = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/repositories/library/hello/tags/v1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let controller = controller("http://127.0.0.1:1", &target.uri()).await;
    controller.register_policy(policy(1)).await.unwrap();
    let router = create_router(controller.clone(), SECRET);

    let (status, body) = call(
        &router,
        "POST",
        "/api/jobs/replication",
        Some(json!({
            "policy_id": 1,
            "metadata": {"operation": "delete", "repository": "library/hello", "tags": ["v1"]}
        })),
        Some(SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();

    let StatusReport::Execution(execution) = wait_for_terminal(&controller, &id).await else {
        panic!("expected an execution");
    };
    assert_eq!(execution.status, JobStatus::Finished);
    assert_eq!(execution.jobs.len(), 1);

    let (status, body) = call(&router, "GET", &format!("/api/jobs/replication/{}", execution.jobs[0]), None, Some(SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["repository"], "library/hello");
    assert!(!body["log"].as_array().unwrap().is_empty());

    let (status, body) = call(&router, "PUT", &format!("/api/jobs/replication/{}/stop", id), None, Some(SECRET)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn catalog_is_expanded_through_filters() {
    let source = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "repositories": ["library/nginx", "library/redis", "library/team/nginx", "other/nginx"]
        })))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/library/nginx/tags/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "library/nginx",
            "tags": ["1.25", "latest", "edge"]
        })))
        .mount(&source)
        .await;

    // The target is unreachable: jobs give up at once with no retries left.
    let controller = controller(&source.uri(), "http://127.0.0.1:1").await;
    let mut filtered = policy(3);
    filtered.filters = vec![
        Filter { kind: FilterKind::Repository, pattern: "library/*".to_string() },
        Filter { kind: FilterKind::Tag, pattern: "1.*".to_string() },
    ];
    controller.register_policy(filtered).await.unwrap();

    let id = controller.create_job(3, None).await.unwrap();
    let StatusReport::Execution(execution) = controller.status(&id).unwrap() else {
        panic!("expected an execution");
    };
    // library/redis has no tags listed (404), so only nginx remains.
    assert_eq!(execution.jobs.len(), 1);
    let StatusReport::Job(job) = controller.status(&execution.jobs[0]).unwrap() else {
        panic!("expected a job");
    };
    assert_eq!(job.repository, "library/nginx");
    assert_eq!(job.tags, vec!["1.25"]);

    let report = wait_for_terminal(&controller, &id).await;
    assert_eq!(report.status(), JobStatus::Failed);
    assert!(report.error().is_some());
}

#[tokio::test]
async fn immediate_policies_react_to_events() {
    let controller = controller("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let mut immediate = policy(4);
    immediate.trigger = Trigger::Immediate;
    immediate.replicate_deletion = false;
    controller.register_policy(immediate).await.unwrap();

    let pushed = controller
        .on_event("library", "library/hello", &["v1".to_string()], WatchOperation::Push)
        .await
        .unwrap();
    assert_eq!(pushed.len(), 1);
    controller.cancel(&pushed[0]).unwrap();

    // Deletions are not watched by this policy.
    let deleted = controller
        .on_event("library", "library/hello", &[], WatchOperation::Delete)
        .await
        .unwrap();
    assert!(deleted.is_empty());

    let other = controller
        .on_event("other", "other/hello", &[], WatchOperation::Push)
        .await
        .unwrap();
    assert!(other.is_empty());

    controller.remove_policy(4).await.unwrap();
    let after_removal = controller
        .on_event("library", "library/hello", &[], WatchOperation::Push)
        .await
        .unwrap();
    assert!(after_removal.is_empty());
}

#[tokio::test]
async fn sweep_runs_scheduled_policies_once_per_interval() {
    let source = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "repositories": [] })))
        .mount(&source)
        .await;

    let controller = controller(&source.uri(), "http://127.0.0.1:1").await;
    let mut scheduled = policy(5);
    scheduled.trigger = Trigger::Scheduled;
    controller.register_policy(scheduled).await.unwrap();
    controller.register_policy(policy(6)).await.unwrap();

    let first = controller.sweep().await.unwrap();
    assert_eq!(first.len(), 1);
    let report = wait_for_terminal(&controller, &first[0]).await;
    assert_eq!(report.status(), JobStatus::Finished);

    assert!(controller.sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn retrying_job_resumes_once_the_target_is_back() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut settings = settings("http://127.0.0.1:1");
    settings.max_retries = 10;
    settings.retry_interval = Duration::from_millis(100);
    let factory = Arc::new(ClientFactory::new(Transports::new().unwrap()));
    let controller = with_target(Controller::builder(settings, factory).build(), &format!("http://{}", addr)).await;
    controller.register_policy(policy(1)).await.unwrap();

    let id = controller.create_job(1, Some(delete_tag("v1"))).await.unwrap();
    let job_id = first_job(&controller, &id);

    let mut retrying = false;
    for _ in 0..400 {
        if controller.status(&job_id).unwrap().status() == JobStatus::Retrying {
            retrying = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(retrying, "job never waited for a retry");

    let target = MockServer::builder()
        .listener(std::net::TcpListener::bind(addr).unwrap())
        .start()
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/repositories/library/hello/tags/v1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let report = wait_for_terminal(&controller, &id).await;
    assert_eq!(report.status(), JobStatus::Finished);
    let StatusReport::Job(job) = controller.status(&job_id).unwrap() else {
        panic!("expected a job");
    };
    assert_eq!(job.status, JobStatus::Finished);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn terminal_records_are_pruned_after_retention() {
    let target = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/repositories/library/hello/tags/v1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&target)
        .await;

    // Default retention keeps a fresh record.
    let kept = controller("http://127.0.0.1:1", &target.uri()).await;
    kept.register_policy(policy(1)).await.unwrap();
    let id = kept.create_job(1, Some(delete_tag("v1"))).await.unwrap();
    wait_for_terminal(&kept, &id).await;
    assert_eq!(kept.prune(), 0);
    assert!(kept.status(&id).is_ok());

    let mut settings = settings("http://127.0.0.1:1");
    settings.record_retention = Duration::ZERO;
    let factory = Arc::new(ClientFactory::new(Transports::new().unwrap()));
    let pruned = with_target(Controller::builder(settings, factory).build(), &target.uri()).await;
    pruned.register_policy(policy(1)).await.unwrap();
    let id = pruned.create_job(1, Some(delete_tag("v1"))).await.unwrap();
    let job_id = first_job(&pruned, &id);
    wait_for_terminal(&pruned, &id).await;

    assert_eq!(pruned.prune(), 1);
    assert!(pruned.status(&id).unwrap_err().is_not_found());
    assert!(pruned.status(&job_id).unwrap_err().is_not_found());
    assert_eq!(pruned.prune(), 0);
}

#[tokio::test]
async fn sweep_skips_policies_with_a_running_execution() {
    let source = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "repositories": ["library/hello"] })))
        .mount(&source)
        .await;
    // Keeps the first execution busy while the second sweep runs.
    Mock::given(method("GET"))
        .and(path("/v2/library/hello/tags/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "library/hello", "tags": [] }))
                .set_delay(Duration::from_secs(1)),
        )
        .mount(&source)
        .await;
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let factory = Arc::new(ClientFactory::new(Transports::new().unwrap()));
    let controller = Controller::builder(settings(&source.uri()), factory)
        .markers(Arc::new(Markers::new(Duration::ZERO)))
        .build();
    let controller = with_target(controller, &target.uri()).await;
    let mut scheduled = policy(5);
    scheduled.trigger = Trigger::Scheduled;
    controller.register_policy(scheduled).await.unwrap();

    let first = controller.sweep().await.unwrap();
    assert_eq!(first.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(controller.sweep().await.unwrap().is_empty());

    let report = wait_for_terminal(&controller, &first[0]).await;
    assert_eq!(report.status(), JobStatus::Finished);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(controller.sweep().await.unwrap().len(), 1);
    controller.shutdown();
}
