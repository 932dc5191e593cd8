//! Launch substrate backed by local child processes

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::deploy::config::DeploymentConfiguration;
use crate::errors::PlatformError;
use crate::launch::{LaunchSubstrate, LaunchTicket, TaskStatus};

#[derive(Default)]
struct Tasks {
    running: HashMap<String, Child>,
    exited: HashMap<String, i32>,
}

/// Runs each executor as a child process of the control plane.
///
/// The child gets a clean environment holding only the deployment
/// configuration plus `PATH` and `HOME`.
pub struct LocalProcessSubstrate {
    executable: PathBuf,
    args: Vec<String>,
    tasks: Mutex<Tasks>,
}

impl LocalProcessSubstrate {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Launch the running binary in executor mode
    pub fn current_exe() -> Result<Self, PlatformError> {
        let executable = std::env::current_exe()?;
        Ok(Self::new(executable, vec!["--build".to_string()]))
    }
}

#[async_trait]
impl LaunchSubstrate for LocalProcessSubstrate {
    async fn launch(&self, config: &DeploymentConfiguration) -> Result<LaunchTicket, PlatformError> {
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .env_clear()
            .envs(&config.environment)
            .envs(config.secrets.iter().map(|(k, v)| (k, v.expose_secret())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        for name in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }

        let child = command.spawn().map_err(|e| {
            PlatformError::LaunchError(format!(
                "failed to start {}: {}",
                self.executable.display(),
                e
            ))
        })?;

        let task_id = format!("{}/{}", config.target.cluster, Uuid::new_v4());
        info!(
            "Launched executor {} (pid {:?}) on {}",
            task_id,
            child.id(),
            config.target.task_definition
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.running.insert(task_id.clone(), child);
        Ok(LaunchTicket { task_id })
    }

    async fn status(&self, ticket: &LaunchTicket) -> Result<TaskStatus, PlatformError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(code) = tasks.exited.get(&ticket.task_id) {
            return Ok(TaskStatus::Exited { code: *code });
        }

        let Some(child) = tasks.running.get_mut(&ticket.task_id) else {
            return Ok(TaskStatus::Lost);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                // Killed by a signal has no code
                let code = status.code().unwrap_or(-1);
                debug!("Executor {} exited with {}", ticket.task_id, code);
                tasks.running.remove(&ticket.task_id);
                tasks.exited.insert(ticket.task_id.clone(), code);
                Ok(TaskStatus::Exited { code })
            }
            Ok(None) => Ok(TaskStatus::Running),
            Err(e) => {
                warn!("Unable to poll executor {}: {}", ticket.task_id, e);
                tasks.running.remove(&ticket.task_id);
                Ok(TaskStatus::Lost)
            }
        }
    }

    async fn stop(&self, ticket: &LaunchTicket) -> Result<(), PlatformError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut child) = tasks.running.remove(&ticket.task_id) else {
            return Ok(());
        };

        let code = match child.try_wait() {
            Ok(Some(status)) => status.code().unwrap_or(-1),
            _ => {
                child.start_kill().map_err(|e| {
                    PlatformError::LaunchError(format!("failed to stop {}: {}", ticket.task_id, e))
                })?;
                info!("Stopped executor {}", ticket.task_id);
                -1
            }
        };
        tasks.exited.insert(ticket.task_id.clone(), code);
        Ok(())
    }

    async fn release(&self, ticket: &LaunchTicket) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.exited.remove(&ticket.task_id);
        if tasks.running.remove(&ticket.task_id).is_some() {
            warn!("Released executor {} while it was still running", ticket.task_id);
        }
    }
}
