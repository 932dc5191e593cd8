//! Compute launch substrate

pub mod process;

use async_trait::async_trait;

use crate::deploy::config::DeploymentConfiguration;
use crate::errors::PlatformError;

/// Handle for a launched executor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchTicket {
    pub task_id: String,
}

/// Observed state of a launched executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Accepted but not started yet
    Pending,
    Running,
    Exited { code: i32 },
    /// The substrate no longer knows the task
    Lost,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Exited { .. } => "exited",
            TaskStatus::Lost => "lost",
        }
    }
}

/// Starts one isolated build executor per deployment.
///
/// Only the configuration crosses this boundary; the executor reports back
/// through its exit status and the log transport.
#[async_trait]
pub trait LaunchSubstrate: Send + Sync {
    /// Accept or reject a launch request
    async fn launch(&self, config: &DeploymentConfiguration) -> Result<LaunchTicket, PlatformError>;

    async fn status(&self, ticket: &LaunchTicket) -> Result<TaskStatus, PlatformError>;

    /// Terminate the executor. Stopping a task that already exited is not an error.
    async fn stop(&self, ticket: &LaunchTicket) -> Result<(), PlatformError>;

    /// Forget a task whose deployment has reached a terminal status
    async fn release(&self, _ticket: &LaunchTicket) {}
}
