//! Finite State Machine for deployment status

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// FSM settings
#[derive(Debug, Clone)]
pub struct FsmSettings {
    /// Maximum time a deployment may stay non-terminal before it is failed
    pub deployment_timeout: Duration,
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self {
            deployment_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Admitted, executor not yet launched
    Queued,

    /// Executor launched and building
    InProgress,

    /// Built and published
    Ready,

    /// Failed at any stage
    Failed,
}

impl DeploymentStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Ready | DeploymentStatus::Failed)
    }

    /// At most one active deployment may exist per project
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "QUEUED",
            DeploymentStatus::InProgress => "IN_PROGRESS",
            DeploymentStatus::Ready => "READY",
            DeploymentStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(DeploymentStatus::Queued),
            "IN_PROGRESS" => Ok(DeploymentStatus::InProgress),
            "READY" => Ok(DeploymentStatus::Ready),
            "FAILED" => Ok(DeploymentStatus::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// The launch substrate accepted the executor
    LaunchAccepted,

    /// The launch substrate rejected or failed to start the executor
    LaunchFailed(String),

    /// The executor exited successfully after publishing
    BuildSucceeded,

    /// The executor exited with a failure
    BuildFailed(String),

    /// The deployment stayed non-terminal for too long
    TimedOut(Duration),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self {
            state: DeploymentStatus::Queued,
            error: None,
        }
    }

    /// Resume an FSM from a persisted status
    pub fn from_parts(state: DeploymentStatus, error: Option<String>) -> Self {
        Self { state, error }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // From Queued
            (DeploymentStatus::Queued, DeploymentEvent::LaunchAccepted) => DeploymentStatus::InProgress,
            (DeploymentStatus::Queued, DeploymentEvent::LaunchFailed(err)) => {
                self.error = Some(format!("launch failed: {}", err));
                DeploymentStatus::Failed
            }

            // From InProgress
            (DeploymentStatus::InProgress, DeploymentEvent::BuildSucceeded) => DeploymentStatus::Ready,

            // From either non-terminal state
            (DeploymentStatus::Queued | DeploymentStatus::InProgress, DeploymentEvent::BuildFailed(err)) => {
                self.error = Some(err.clone());
                DeploymentStatus::Failed
            }
            (DeploymentStatus::Queued | DeploymentStatus::InProgress, DeploymentEvent::TimedOut(after)) => {
                self.error = Some(format!("deployment timed out after {}s", after.as_secs()));
                DeploymentStatus::Failed
            }

            // Invalid transitions, including anything out of a terminal state
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
