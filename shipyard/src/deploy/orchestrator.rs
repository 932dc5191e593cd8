//! Deployment orchestrator: admission, launch and status reconciliation

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::deploy::config::LaunchTemplate;
use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus, FsmSettings};
use crate::errors::PlatformError;
use crate::launch::{LaunchSubstrate, LaunchTicket, TaskStatus};
use crate::models::deployment::{Deployment, DeploymentTicket};
use crate::models::project::{NewProject, Project};
use crate::storage::store::ProjectStore;
use crate::utils::{generate_slug, is_valid_subdomain};

/// Compare-and-set attempts before giving up on a contended deployment
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub fsm: FsmSettings,
    /// e.g. `http://localhost:9000`
    pub public_base_url: String,
    /// Generated subdomains tried before giving up
    pub slug_attempts: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            fsm: FsmSettings::default(),
            public_base_url: "http://localhost:9000".to_string(),
            slug_attempts: 8,
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: Vec<Deployment>,
}

pub struct Orchestrator {
    store: Arc<dyn ProjectStore>,
    substrate: Arc<dyn LaunchSubstrate>,
    template: LaunchTemplate,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        substrate: Arc<dyn LaunchSubstrate>,
        template: LaunchTemplate,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            substrate,
            template,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Register a project, generating a subdomain when none is given
    pub async fn create_project(&self, input: NewProject) -> Result<Project, PlatformError> {
        let name = input.name.trim();
        let repository_url = input.repository_url.trim();
        if name.is_empty() {
            return Err(PlatformError::ValidationError("name must not be empty".to_string()));
        }
        if repository_url.is_empty() {
            return Err(PlatformError::ValidationError(
                "repositoryUrl must not be empty".to_string(),
            ));
        }

        let mut project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            repository_url: repository_url.to_string(),
            subdomain: String::new(),
            created_at: Utc::now(),
        };

        if let Some(subdomain) = input.subdomain {
            if !is_valid_subdomain(&subdomain) {
                return Err(PlatformError::ValidationError(format!(
                    "invalid subdomain: {}",
                    subdomain
                )));
            }
            project.subdomain = subdomain;
            self.store.insert_project(&project).await?;
            info!("Created project {} ({})", project.id, project.subdomain);
            return Ok(project);
        }

        for attempt in 0..self.options.slug_attempts {
            project.subdomain = generate_slug();
            match self.store.insert_project(&project).await {
                Ok(()) => {
                    info!("Created project {} ({})", project.id, project.subdomain);
                    return Ok(project);
                }
                Err(PlatformError::Conflict(_)) => {
                    debug!("Subdomain {} taken (attempt {})", project.subdomain, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }

        Err(PlatformError::Conflict(
            "unable to allocate a unique subdomain".to_string(),
        ))
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project, PlatformError> {
        self.store
            .find_project(id)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("project {}", id)))
    }

    pub async fn get_deployment(&self, id: Uuid) -> Result<Deployment, PlatformError> {
        self.store
            .find_deployment(id)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("deployment {}", id)))
    }

    /// Admit and launch a deployment.
    ///
    /// Admission is one conditional insert, so concurrent requests for the
    /// same project cannot both pass. A rejected launch fails the deployment
    /// before returning, which frees the project for the next request.
    pub async fn request_deployment(&self, project_id: Uuid) -> Result<DeploymentTicket, PlatformError> {
        let project = self.get_project(project_id).await?;

        let deployment = Deployment::queued(project.id);
        if !self.store.insert_deployment_if_idle(&deployment).await? {
            return Err(PlatformError::Conflict(format!(
                "project {} already has an active deployment",
                project.id
            )));
        }
        info!("Queued deployment {} for project {}", deployment.id, project.id);

        let config = self.template.configure(&project, &deployment);
        let ticket = match self.substrate.launch(&config).await {
            Ok(ticket) => ticket,
            Err(e) => {
                error!("Launch of deployment {} failed: {}", deployment.id, e);
                if let Err(update) = self
                    .apply_event(deployment.id, DeploymentEvent::LaunchFailed(e.to_string()))
                    .await
                {
                    error!("Unable to fail deployment {}: {}", deployment.id, update);
                }
                return Err(match e {
                    PlatformError::LaunchError(message) => PlatformError::LaunchError(message),
                    other => PlatformError::LaunchError(other.to_string()),
                });
            }
        };

        let launched = self.record_launch(&deployment, &ticket).await?;
        Ok(DeploymentTicket {
            url: self.public_url(&project.subdomain),
            // Responses report the admitted status
            deployment: Deployment {
                status: DeploymentStatus::Queued,
                ..launched
            },
        })
    }

    /// Move a queued deployment to IN_PROGRESS with its task handle
    async fn record_launch(
        &self,
        deployment: &Deployment,
        ticket: &LaunchTicket,
    ) -> Result<Deployment, PlatformError> {
        let mut launched = deployment
            .apply(DeploymentEvent::LaunchAccepted)
            .map_err(PlatformError::Internal)?;
        launched.task_id = Some(ticket.task_id.clone());

        if self
            .store
            .update_deployment(&launched, DeploymentStatus::Queued)
            .await?
        {
            info!("Deployment {} launched as {}", deployment.id, ticket.task_id);
            return Ok(launched);
        }

        // Someone else moved it first, e.g. the timeout
        warn!("Deployment {} changed during launch", deployment.id);
        self.get_deployment(deployment.id).await
    }

    /// Apply an event with compare-and-set, retrying on concurrent writers.
    ///
    /// Events that do not apply to the current status are a `Conflict`.
    pub async fn apply_event(
        &self,
        deployment_id: Uuid,
        event: DeploymentEvent,
    ) -> Result<Deployment, PlatformError> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.get_deployment(deployment_id).await?;
            let next = current
                .apply(event.clone())
                .map_err(PlatformError::Conflict)?;

            if self.store.update_deployment(&next, current.status).await? {
                debug!(
                    "Deployment {}: {} -> {}",
                    deployment_id, current.status, next.status
                );
                return Ok(next);
            }
        }

        Err(PlatformError::Conflict(format!(
            "deployment {} is being updated concurrently",
            deployment_id
        )))
    }

    /// Drive every non-terminal deployment towards a terminal status.
    ///
    /// Deployments older than the timeout fail and their executor is
    /// stopped; otherwise the executor's observed exit decides READY or
    /// FAILED. Tasks of deployments that became terminal are released.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PlatformError> {
        let active = self.store.list_active_deployments().await?;
        let mut report = ReconcileReport {
            checked: active.len(),
            updated: Vec::new(),
        };

        for deployment in active {
            let event = match self.observe(&deployment).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Unable to observe deployment {}: {}", deployment.id, e);
                    continue;
                }
            };

            let ticket = deployment.task_id.clone().map(|task_id| LaunchTicket { task_id });

            // Stop before failing so the project never admits next to a live executor
            if let (DeploymentEvent::TimedOut(_), Some(ticket)) = (&event, &ticket) {
                if let Err(e) = self.substrate.stop(ticket).await {
                    warn!("Unable to stop executor {}: {}", ticket.task_id, e);
                    continue;
                }
            }

            match self.apply_event(deployment.id, event).await {
                Ok(updated) => {
                    info!("Deployment {} is now {}", updated.id, updated.status);
                    if let (true, Some(ticket)) = (updated.status.is_terminal(), &ticket) {
                        self.substrate.release(ticket).await;
                    }
                    report.updated.push(updated);
                }
                // Already moved on by another writer
                Err(PlatformError::Conflict(e)) => debug!("{}", e),
                Err(e) => warn!("Unable to update deployment {}: {}", deployment.id, e),
            }
        }

        Ok(report)
    }

    async fn observe(&self, deployment: &Deployment) -> Result<Option<DeploymentEvent>, PlatformError> {
        let age = (Utc::now() - deployment.created_at).to_std().unwrap_or_default();
        if age > self.options.fsm.deployment_timeout {
            return Ok(Some(DeploymentEvent::TimedOut(self.options.fsm.deployment_timeout)));
        }

        // Still launching
        let Some(task_id) = &deployment.task_id else {
            return Ok(None);
        };

        let ticket = LaunchTicket {
            task_id: task_id.clone(),
        };
        let event = match self.substrate.status(&ticket).await? {
            TaskStatus::Pending | TaskStatus::Running => None,
            TaskStatus::Exited { code: 0 } => Some(DeploymentEvent::BuildSucceeded),
            TaskStatus::Exited { code } => Some(DeploymentEvent::BuildFailed(format!(
                "build executor exited with code {}",
                code
            ))),
            TaskStatus::Lost => Some(DeploymentEvent::BuildFailed(
                "build executor was lost".to_string(),
            )),
        };
        Ok(event)
    }

    /// Public URL a project is served from
    pub fn public_url(&self, subdomain: &str) -> String {
        public_url(&self.options.public_base_url, subdomain)
    }
}

/// `http://localhost:9000` + `demo` gives `http://demo.localhost:9000`
pub fn public_url(base: &str, subdomain: &str) -> String {
    match Url::parse(base) {
        Ok(url) => {
            let host = url.host_str().unwrap_or("localhost");
            let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
            format!("{}://{}.{}{}", url.scheme(), subdomain, host, port)
        }
        Err(_) => format!("http://{}.{}", subdomain, base.trim_end_matches('/')),
    }
}
