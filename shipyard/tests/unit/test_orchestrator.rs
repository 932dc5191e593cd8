//! Orchestrator tests: admission, launch and reconciliation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use shipyard::deploy::config::{vars, DeploymentConfiguration, LaunchTemplate};
use shipyard::deploy::fsm::{DeploymentStatus, FsmSettings};
use shipyard::deploy::orchestrator::{Orchestrator, OrchestratorOptions};
use shipyard::errors::PlatformError;
use shipyard::launch::{LaunchSubstrate, LaunchTicket, TaskStatus};
use shipyard::models::deployment::Deployment;
use shipyard::models::project::{NewProject, Project};
use shipyard::storage::settings::Settings;
use shipyard::storage::store::{MemoryStore, ProjectStore};

/// Launch substrate whose answers are set by the test
#[derive(Default)]
pub struct ScriptedSubstrate {
    reject: AtomicBool,
    launched: Mutex<Vec<DeploymentConfiguration>>,
    statuses: Mutex<HashMap<String, TaskStatus>>,
    stopped: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
}

impl ScriptedSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_launches(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<DeploymentConfiguration> {
        self.launched.lock().unwrap().clone()
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) {
        self.statuses.lock().unwrap().insert(task_id.to_string(), status);
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl LaunchSubstrate for ScriptedSubstrate {
    async fn launch(&self, config: &DeploymentConfiguration) -> Result<LaunchTicket, PlatformError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(PlatformError::LaunchError("no capacity".to_string()));
        }
        self.launched.lock().unwrap().push(config.clone());
        let task_id = format!("task-{}", config.env(vars::DEPLOYMENT_ID).unwrap_or_default());
        self.statuses
            .lock()
            .unwrap()
            .insert(task_id.clone(), TaskStatus::Running);
        Ok(LaunchTicket { task_id })
    }

    async fn status(&self, ticket: &LaunchTicket) -> Result<TaskStatus, PlatformError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&ticket.task_id)
            .copied()
            .unwrap_or(TaskStatus::Lost))
    }

    async fn stop(&self, ticket: &LaunchTicket) -> Result<(), PlatformError> {
        self.stopped.lock().unwrap().push(ticket.task_id.clone());
        self.set_status(&ticket.task_id, TaskStatus::Exited { code: -1 });
        Ok(())
    }

    async fn release(&self, ticket: &LaunchTicket) {
        self.released.lock().unwrap().push(ticket.task_id.clone());
        self.statuses.lock().unwrap().remove(&ticket.task_id);
    }
}

pub fn orchestrator(store: Arc<dyn ProjectStore>, substrate: Arc<ScriptedSubstrate>) -> Orchestrator {
    Orchestrator::new(
        store,
        substrate,
        LaunchTemplate::from_settings(&Settings::default()),
        OrchestratorOptions::default(),
    )
}

pub fn demo_project() -> NewProject {
    NewProject {
        name: "demo".to_string(),
        repository_url: "https://example.com/repo.git".to_string(),
        subdomain: None,
    }
}

async fn setup() -> (Orchestrator, Arc<MemoryStore>, Arc<ScriptedSubstrate>, Project) {
    let store = Arc::new(MemoryStore::new());
    let substrate = Arc::new(ScriptedSubstrate::new());
    let orchestrator = orchestrator(store.clone(), substrate.clone());
    let project = orchestrator.create_project(demo_project()).await.unwrap();
    (orchestrator, store, substrate, project)
}

#[tokio::test]
async fn test_request_deployment_then_conflict() {
    let (orchestrator, store, substrate, project) = setup().await;

    let ticket = orchestrator.request_deployment(project.id).await.unwrap();
    assert_eq!(ticket.deployment.status, DeploymentStatus::Queued);
    assert_eq!(ticket.deployment.project_id, project.id);
    assert_eq!(ticket.url, format!("http://{}.localhost:9000", project.subdomain));

    let second = orchestrator.request_deployment(project.id).await;
    assert!(matches!(second, Err(PlatformError::Conflict(_))));

    // Only the first deployment was stored and launched
    assert_eq!(store.deployments_for_project(project.id).len(), 1);
    assert_eq!(substrate.launched().len(), 1);

    let stored = orchestrator.get_deployment(ticket.deployment.id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::InProgress);
    assert!(stored.task_id.is_some());
}

#[tokio::test]
async fn test_launch_configuration_environment() {
    let (orchestrator, _store, substrate, project) = setup().await;

    let ticket = orchestrator.request_deployment(project.id).await.unwrap();

    let launched = substrate.launched();
    let config = &launched[0];
    assert_eq!(config.env(vars::GIT_REPOSITORY_URL), Some("https://example.com/repo.git"));
    assert_eq!(config.env(vars::PROJECT_ID), Some(project.id.to_string().as_str()));
    assert_eq!(
        config.env(vars::DEPLOYMENT_ID),
        Some(ticket.deployment.id.to_string().as_str())
    );
    assert_eq!(config.target.cluster, "local");
}

#[tokio::test]
async fn test_unknown_project_is_not_found() {
    let (orchestrator, _store, _substrate, _project) = setup().await;

    let result = orchestrator.request_deployment(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(PlatformError::NotFound(_))));
}

#[tokio::test]
async fn test_concurrent_requests_admit_exactly_one() {
    let (orchestrator, store, _substrate, project) = setup().await;
    let orchestrator = Arc::new(orchestrator);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.request_deployment(project.id).await
        }));
    }

    let mut admitted = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(PlatformError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 15);
    let active = store
        .find_active_deployments_for_project(project.id)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_different_projects_are_independent() {
    let (orchestrator, _store, _substrate, first) = setup().await;
    let second = orchestrator.create_project(demo_project()).await.unwrap();
    assert_ne!(first.subdomain, second.subdomain);

    orchestrator.request_deployment(first.id).await.unwrap();
    orchestrator.request_deployment(second.id).await.unwrap();
}

#[tokio::test]
async fn test_launch_failure_frees_the_project() {
    let (orchestrator, _store, substrate, project) = setup().await;

    substrate.reject_launches(true);
    let result = orchestrator.request_deployment(project.id).await;
    assert!(matches!(result, Err(PlatformError::LaunchError(_))));

    // The rejected deployment is failed, not left queued
    substrate.reject_launches(false);
    let ticket = orchestrator.request_deployment(project.id).await.unwrap();
    assert_eq!(ticket.deployment.status, DeploymentStatus::Queued);
}

#[tokio::test]
async fn test_reconcile_maps_exit_codes() {
    let (orchestrator, _store, substrate, project) = setup().await;
    let other = orchestrator.create_project(demo_project()).await.unwrap();

    let ok = orchestrator.request_deployment(project.id).await.unwrap();
    let bad = orchestrator.request_deployment(other.id).await.unwrap();

    let ok_task = orchestrator.get_deployment(ok.deployment.id).await.unwrap().task_id.unwrap();
    let bad_task = orchestrator.get_deployment(bad.deployment.id).await.unwrap().task_id.unwrap();

    // Still running: nothing changes
    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.checked, 2);
    assert!(report.updated.is_empty());

    substrate.set_status(&ok_task, TaskStatus::Exited { code: 0 });
    substrate.set_status(&bad_task, TaskStatus::Exited { code: 1 });
    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.updated.len(), 2);
    // Exited executors are released, never stopped
    assert_eq!(substrate.released().len(), 2);
    assert!(substrate.stopped().is_empty());

    let ok = orchestrator.get_deployment(ok.deployment.id).await.unwrap();
    assert_eq!(ok.status, DeploymentStatus::Ready);

    let bad = orchestrator.get_deployment(bad.deployment.id).await.unwrap();
    assert_eq!(bad.status, DeploymentStatus::Failed);
    assert_eq!(bad.error.as_deref(), Some("build executor exited with code 1"));

    // Terminal deployments are no longer checked
    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn test_reconcile_lost_executor_fails() {
    let (orchestrator, _store, substrate, project) = setup().await;

    let ticket = orchestrator.request_deployment(project.id).await.unwrap();
    let task = orchestrator
        .get_deployment(ticket.deployment.id)
        .await
        .unwrap()
        .task_id
        .unwrap();
    substrate.set_status(&task, TaskStatus::Lost);

    orchestrator.reconcile().await.unwrap();
    let deployment = orchestrator.get_deployment(ticket.deployment.id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_reconcile_times_out_stale_deployments() {
    let (orchestrator, store, _substrate, project) = setup().await;

    let mut stale = Deployment::queued(project.id);
    stale.created_at = Utc::now() - ChronoDuration::hours(2);
    assert!(store.insert_deployment_if_idle(&stale).await.unwrap());

    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.updated.len(), 1);

    let stale = orchestrator.get_deployment(stale.id).await.unwrap();
    assert_eq!(stale.status, DeploymentStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some("deployment timed out after 1800s"));

    // The project accepts a new deployment afterwards
    orchestrator.request_deployment(project.id).await.unwrap();
}

#[tokio::test]
async fn test_timeout_stops_the_running_executor() {
    let store = Arc::new(MemoryStore::new());
    let substrate = Arc::new(ScriptedSubstrate::new());
    let orchestrator = Orchestrator::new(
        store,
        substrate.clone(),
        LaunchTemplate::from_settings(&Settings::default()),
        OrchestratorOptions {
            fsm: FsmSettings {
                deployment_timeout: std::time::Duration::from_millis(50),
            },
            ..OrchestratorOptions::default()
        },
    );
    let project = orchestrator.create_project(demo_project()).await.unwrap();

    let ticket = orchestrator.request_deployment(project.id).await.unwrap();
    let task = orchestrator
        .get_deployment(ticket.deployment.id)
        .await
        .unwrap()
        .task_id
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.updated.len(), 1);

    let deployment = orchestrator.get_deployment(ticket.deployment.id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(substrate.stopped(), vec![task.clone()]);
    assert_eq!(substrate.released(), vec![task]);
}

#[tokio::test]
async fn test_create_project_validation() {
    let (orchestrator, _store, _substrate, _project) = setup().await;

    let empty_name = orchestrator
        .create_project(NewProject {
            name: "  ".to_string(),
            ..demo_project()
        })
        .await;
    assert!(matches!(empty_name, Err(PlatformError::ValidationError(_))));

    let empty_url = orchestrator
        .create_project(NewProject {
            repository_url: String::new(),
            ..demo_project()
        })
        .await;
    assert!(matches!(empty_url, Err(PlatformError::ValidationError(_))));

    let bad_subdomain = orchestrator
        .create_project(NewProject {
            subdomain: Some("-Bad_Name".to_string()),
            ..demo_project()
        })
        .await;
    assert!(matches!(bad_subdomain, Err(PlatformError::ValidationError(_))));
}

#[tokio::test]
async fn test_supplied_subdomain_is_unique() {
    let (orchestrator, _store, _substrate, _project) = setup().await;

    let chosen = NewProject {
        subdomain: Some("my-site".to_string()),
        ..demo_project()
    };
    let project = orchestrator.create_project(chosen.clone()).await.unwrap();
    assert_eq!(project.subdomain, "my-site");

    let taken = orchestrator.create_project(chosen).await;
    assert!(matches!(taken, Err(PlatformError::Conflict(_))));
}
