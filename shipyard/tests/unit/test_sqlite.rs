//! SQLite store tests

use std::sync::Arc;

use chrono::Utc;
use shipyard::deploy::fsm::{DeploymentEvent, DeploymentStatus};
use shipyard::errors::PlatformError;
use shipyard::models::deployment::Deployment;
use shipyard::models::log_event::{LogEvent, LogSource};
use shipyard::models::project::Project;
use shipyard::storage::db::Db;
use shipyard::storage::store::ProjectStore;
use shipyard::transport::durable::{AppendLog, DurableSink, LogStore};
use shipyard::transport::emitter::LogEmitter;
use shipyard::workers::ingester::process_batch;
use uuid::Uuid;

fn project(subdomain: &str) -> Project {
    Project {
        id: Uuid::new_v4(),
        name: "demo".to_string(),
        repository_url: "https://example.com/repo.git".to_string(),
        subdomain: subdomain.to_string(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_project_round_trip_and_unique_subdomain() {
    let db = Db::open_memory().unwrap();
    let demo = project("calm-misty-river");
    db.insert_project(&demo).await.unwrap();

    assert_eq!(db.find_project(demo.id).await.unwrap(), Some(demo.clone()));
    assert_eq!(
        db.find_project_by_subdomain("calm-misty-river").await.unwrap(),
        Some(demo.clone())
    );
    assert_eq!(db.find_project(Uuid::new_v4()).await.unwrap(), None);

    let taken = db.insert_project(&project("calm-misty-river")).await;
    assert!(matches!(taken, Err(PlatformError::Conflict(_))));
}

#[tokio::test]
async fn test_admission_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shipyard.db");
    let first = Db::open(&path).unwrap();
    let second = Db::open(&path).unwrap();

    let demo = project("demo");
    first.insert_project(&demo).await.unwrap();

    let a = Deployment::queued(demo.id);
    let b = Deployment::queued(demo.id);
    assert!(first.insert_deployment_if_idle(&a).await.unwrap());
    assert!(!second.insert_deployment_if_idle(&b).await.unwrap());

    let active = second.find_active_deployments_for_project(demo.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, a.id);

    // Once terminal, the project admits again
    let failed = a.apply(DeploymentEvent::LaunchFailed("no capacity".to_string())).unwrap();
    assert!(first.update_deployment(&failed, DeploymentStatus::Queued).await.unwrap());
    assert!(second.insert_deployment_if_idle(&b).await.unwrap());
}

#[tokio::test]
async fn test_update_is_compare_and_set() {
    let db = Db::open_memory().unwrap();
    let demo = project("demo");
    db.insert_project(&demo).await.unwrap();

    let queued = Deployment::queued(demo.id);
    db.insert_deployment_if_idle(&queued).await.unwrap();

    let mut launched = queued.apply(DeploymentEvent::LaunchAccepted).unwrap();
    launched.task_id = Some("local/1".to_string());
    assert!(db.update_deployment(&launched, DeploymentStatus::Queued).await.unwrap());

    // A second writer still expecting QUEUED loses
    let timed_out = queued
        .apply(DeploymentEvent::TimedOut(std::time::Duration::from_secs(1)))
        .unwrap();
    assert!(!db.update_deployment(&timed_out, DeploymentStatus::Queued).await.unwrap());

    let stored = db.find_deployment(queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::InProgress);
    assert_eq!(stored.task_id.as_deref(), Some("local/1"));

    assert_eq!(db.list_active_deployments().await.unwrap().len(), 1);

    let missing = Deployment::queued(demo.id);
    let result = db.update_deployment(&missing, DeploymentStatus::Queued).await;
    assert!(matches!(result, Err(PlatformError::NotFound(_))));
}

#[tokio::test]
async fn test_durable_log_between_processes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shipyard.db");
    // Executor and control plane each open their own handle
    let executor_db = Arc::new(Db::open(&path).unwrap());
    let control_db = Db::open(&path).unwrap();

    let deployment_id = Uuid::new_v4();
    let emitter = LogEmitter::new(
        Arc::new(DurableSink::new(executor_db.clone())),
        deployment_id,
        Uuid::new_v4(),
    );
    emitter.info("starting build");
    emitter.emit(LogSource::Stderr, "warning: deprecated");
    emitter.close().await.unwrap();

    let report = process_batch(&control_db, &control_db, "ingester", 10).await.unwrap();
    assert_eq!(report.stored, 2);
    assert_eq!(control_db.committed_offset("ingester").unwrap(), 2);

    let logs = control_db.query(deployment_id).await.unwrap();
    let texts: Vec<&str> = logs.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["starting build", "warning: deprecated"]);

    // Another group starts from the beginning
    let fetched = control_db.fetch("audit", 10).await.unwrap();
    assert_eq!(fetched.len(), 2);
    assert_eq!(fetched[0].offset, 1);
}

#[tokio::test]
async fn test_log_insert_is_idempotent() {
    let db = Db::open_memory().unwrap();
    let event = LogEvent {
        event_id: Uuid::new_v4(),
        deployment_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        sequence: 0,
        timestamp: Utc::now(),
        source: LogSource::System,
        text: "deployment complete".to_string(),
    };

    assert!(db.insert(&event).await.unwrap());
    assert!(!db.insert(&event).await.unwrap());
    assert_eq!(db.query(event.deployment_id).await.unwrap().len(), 1);
}
