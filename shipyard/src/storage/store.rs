//! Relational store for projects and deployments

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::PlatformError;
use crate::models::deployment::Deployment;
use crate::models::project::Project;

/// CRUD over Project and Deployment entities
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert a project; a taken subdomain is a `Conflict`
    async fn insert_project(&self, project: &Project) -> Result<(), PlatformError>;

    async fn find_project(&self, id: Uuid) -> Result<Option<Project>, PlatformError>;

    async fn find_project_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>, PlatformError>;

    /// Conditional insert: stores `deployment` only when its project has no
    /// QUEUED or IN_PROGRESS deployment. The check and the insert are one
    /// atomic decision. Returns `false` when admission is refused.
    async fn insert_deployment_if_idle(&self, deployment: &Deployment) -> Result<bool, PlatformError>;

    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>, PlatformError>;

    async fn find_active_deployments_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Deployment>, PlatformError>;

    /// Every QUEUED or IN_PROGRESS deployment
    async fn list_active_deployments(&self) -> Result<Vec<Deployment>, PlatformError>;

    /// Compare-and-set write: replaces the stored row only while its status
    /// is still `expected`. Returns `false` if another writer got there first.
    async fn update_deployment(
        &self,
        deployment: &Deployment,
        expected: DeploymentStatus,
    ) -> Result<bool, PlatformError>;
}

#[derive(Default)]
struct MemoryState {
    projects: HashMap<Uuid, Project>,
    deployments: HashMap<Uuid, Deployment>,
}

/// In-memory store; a single mutex makes each operation atomic
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All deployments of a project, oldest first
    pub fn deployments_for_project(&self, project_id: Uuid) -> Vec<Deployment> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut deployments: Vec<Deployment> = state
            .deployments
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.created_at);
        deployments
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.projects.values().any(|p| p.subdomain == project.subdomain) {
            return Err(PlatformError::Conflict(format!(
                "subdomain {} is already taken",
                project.subdomain
            )));
        }
        state.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn find_project(&self, id: Uuid) -> Result<Option<Project>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.projects.get(&id).cloned())
    }

    async fn find_project_by_subdomain(&self, subdomain: &str) -> Result<Option<Project>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.projects.values().find(|p| p.subdomain == subdomain).cloned())
    }

    async fn insert_deployment_if_idle(&self, deployment: &Deployment) -> Result<bool, PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let busy = state
            .deployments
            .values()
            .any(|d| d.project_id == deployment.project_id && d.status.is_active());
        if busy {
            return Ok(false);
        }
        state.deployments.insert(deployment.id, deployment.clone());
        Ok(true)
    }

    async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.deployments.get(&id).cloned())
    }

    async fn find_active_deployments_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Deployment>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .deployments
            .values()
            .filter(|d| d.project_id == project_id && d.status.is_active())
            .cloned()
            .collect())
    }

    async fn list_active_deployments(&self) -> Result<Vec<Deployment>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .deployments
            .values()
            .filter(|d| d.status.is_active())
            .cloned()
            .collect())
    }

    async fn update_deployment(
        &self,
        deployment: &Deployment,
        expected: DeploymentStatus,
    ) -> Result<bool, PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.deployments.get_mut(&deployment.id) {
            Some(current) if current.status == expected => {
                *current = deployment.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PlatformError::NotFound(format!("deployment {}", deployment.id))),
        }
    }
}
