//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};

/// One build-and-publish attempt for a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique deployment ID
    pub id: Uuid,

    /// Owning project
    pub project_id: Uuid,

    /// Current status
    pub status: DeploymentStatus,

    /// Launch substrate handle, set once the executor is accepted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Terminal failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a new queued deployment
    pub fn queued(project_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            status: DeploymentStatus::Queued,
            task_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an event through the state machine, returning the updated record
    pub fn apply(&self, event: DeploymentEvent) -> Result<Deployment, String> {
        let mut fsm = DeploymentFsm::from_parts(self.status, self.error.clone());
        fsm.process(event)?;

        let mut next = self.clone();
        next.status = fsm.state();
        next.error = fsm.error().map(str::to_string);
        next.updated_at = Utc::now();
        Ok(next)
    }
}

/// Response returned when a deployment is admitted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTicket {
    pub deployment: Deployment,

    /// Public URL the artifact is served from once ready
    pub url: String,
}
