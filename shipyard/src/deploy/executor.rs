//! Build executor: checkout, build, publish

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::deploy::config::BuildEnv;
use crate::deploy::publisher::{PublishReport, Publisher};
use crate::errors::PlatformError;
use crate::models::log_event::LogSource;
use crate::transport::emitter::LogEmitter;

/// What one executor run does
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub deployment_id: Uuid,
    pub project_id: Uuid,
    pub repository_url: String,
    /// Checkout directory; cloned into when it holds no checkout yet
    pub source_path: PathBuf,
    /// Shell command run in the checkout
    pub build_command: String,
    /// Files under this directory are published
    pub output_dir: PathBuf,
}

impl From<&BuildEnv> for BuildPlan {
    fn from(env: &BuildEnv) -> Self {
        Self {
            deployment_id: env.deployment_id,
            project_id: env.project_id,
            repository_url: env.repository_url.clone(),
            source_path: env.source_path.clone(),
            build_command: env.build_command.clone(),
            output_dir: env.output_dir(),
        }
    }
}

/// Runs one deployment's build and publish, reporting through the emitter
pub struct BuildExecutor {
    emitter: LogEmitter,
    publisher: Arc<dyn Publisher>,
}

impl BuildExecutor {
    pub fn new(emitter: LogEmitter, publisher: Arc<dyn Publisher>) -> Self {
        Self { emitter, publisher }
    }

    /// Run the plan to completion.
    ///
    /// Every outcome ends with a final event: "deployment complete" on
    /// success, an `error:` line followed by "deployment failed" otherwise. Publishing only happens after a
    /// successful build.
    pub async fn run(&self, plan: &BuildPlan) -> Result<PublishReport, PlatformError> {
        let result = self.run_steps(plan).await;

        match &result {
            Ok(report) => {
                info!(
                    "Deployment {} published {} objects",
                    plan.deployment_id,
                    report.keys.len()
                );
                self.emitter.info("deployment complete");
            }
            Err(e) => {
                let message = match e {
                    PlatformError::BuildFailure(message) => message.clone(),
                    other => other.to_string(),
                };
                error!("Deployment {} failed: {}", plan.deployment_id, message);
                self.emitter.info(format!("error: {}", message));
                self.emitter.info("deployment failed");
            }
        }

        self.emitter.flush().await;
        result
    }

    async fn run_steps(&self, plan: &BuildPlan) -> Result<PublishReport, PlatformError> {
        self.emitter.info("starting build");
        self.ensure_checkout(plan).await?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&plan.build_command)
            .current_dir(&plan.source_path);
        let status = self.stream(command, "build").await?;
        if !status.success() {
            return Err(PlatformError::BuildFailure(format!(
                "build exited with code {}",
                exit_code(status)
            )));
        }
        self.emitter.info("Build complete");

        self.emitter.info("deploying...");
        self.publisher
            .publish(plan.deployment_id, plan.project_id, &plan.output_dir)
            .await
    }

    /// Clone the repository unless the source path already holds files
    async fn ensure_checkout(&self, plan: &BuildPlan) -> Result<(), PlatformError> {
        if has_checkout(&plan.source_path).await {
            debug!("Using existing checkout at {}", plan.source_path.display());
            return Ok(());
        }

        if let Some(parent) = plan.source_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.emitter.info(format!("cloning {}", plan.repository_url));
        let mut command = Command::new("git");
        command
            .args(["clone", "--depth", "1", &plan.repository_url])
            .arg(&plan.source_path);
        let status = self.stream(command, "git clone").await?;
        if !status.success() {
            return Err(PlatformError::BuildFailure(format!(
                "git clone exited with code {}",
                exit_code(status)
            )));
        }
        Ok(())
    }

    /// Run a command, forwarding each stdout and stderr line as an event
    async fn stream(&self, mut command: Command, what: &str) -> Result<ExitStatus, PlatformError> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PlatformError::BuildFailure(format!("failed to start {}: {}", what, e)))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, self.emitter.clone(), LogSource::Stdout)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, self.emitter.clone(), LogSource::Stderr)));

        let status = child.wait().await?;

        for reader in [stdout, stderr].into_iter().flatten() {
            if let Err(e) = reader.await {
                self.emitter
                    .info(format!("error: something went wrong while reading {} output: {}", what, e));
            }
        }

        Ok(status)
    }
}

async fn forward_lines<R>(reader: R, emitter: LogEmitter, source: LogSource)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => emitter.emit(source, line),
            Ok(None) => break,
            Err(e) => {
                emitter.info(format!("error: unable to read {}: {}", source.as_str(), e));
                break;
            }
        }
    }
}

async fn has_checkout(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Exit code, with signal termination reported as -1
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
