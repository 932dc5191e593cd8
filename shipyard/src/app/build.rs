//! Build mode: one executor run inside a launched task

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::state::build_blob_store;
use crate::deploy::config::BuildEnv;
use crate::deploy::executor::{BuildExecutor, BuildPlan};
use crate::deploy::publisher::{ArtifactPublisher, PublishReport};
use crate::errors::PlatformError;
use crate::storage::db::Db;
use crate::transport::durable::DurableSink;
use crate::transport::emitter::{FanoutSink, LogEmitter, LogSink};
use crate::transport::live::LiveSink;
use crate::transport::mqtt::MqttBus;

/// Longest the executor waits for its log transports before exiting
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open the log sinks the environment asks for
async fn log_sink(env: &BuildEnv) -> Result<Arc<dyn LogSink>, PlatformError> {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();

    if env.log_transport.uses_durable() {
        let path = env.log_database_path.as_ref().ok_or_else(|| {
            PlatformError::ConfigError("durable logs need a database path".to_string())
        })?;
        let db = Arc::new(Db::open(path)?);
        sinks.push(Arc::new(DurableSink::new(db)));
    }

    if env.log_transport.uses_live() {
        let client_id = format!("shipyard-builder-{}", env.deployment_id);
        let bus = Arc::new(MqttBus::connect(&env.mqtt, &client_id).await?);
        sinks.push(Arc::new(LiveSink::new(bus)));
    }

    if sinks.len() == 1 {
        if let Some(sink) = sinks.pop() {
            return Ok(sink);
        }
    }
    Ok(Arc::new(FanoutSink::new(sinks)))
}

/// Build and publish the deployment the environment describes
pub async fn run_build(env: BuildEnv) -> Result<PublishReport, PlatformError> {
    info!(
        deployment_id = %env.deployment_id,
        project_id = %env.project_id,
        transport = env.log_transport.as_str(),
        "Starting build executor"
    );

    let sink = log_sink(&env).await?;
    let emitter = LogEmitter::new(sink, env.deployment_id, env.project_id);

    let store = build_blob_store(&env.blob)?;
    let publisher = ArtifactPublisher::new(store, env.blob.bucket.clone(), env.directory_prefix.clone())
        .with_emitter(emitter.clone());

    let executor = BuildExecutor::new(emitter.clone(), Arc::new(publisher));
    let result = executor.run(&BuildPlan::from(&env)).await;

    match tokio::time::timeout(CLOSE_TIMEOUT, emitter.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to close log transport: {}", e),
        Err(_) => warn!("Log transport did not close within {:?}", CLOSE_TIMEOUT),
    }
    result
}
