//! Application state management

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::options::AppOptions;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::PlatformError;
use crate::launch::process::LocalProcessSubstrate;
use crate::launch::LaunchSubstrate;
use crate::storage::blob::{BlobStore, FsBlobStore, HttpBlobStore};
use crate::storage::db::Db;
use crate::storage::settings::{BlobKind, BlobSettings};
use crate::transport::live::PubSubBus;
use crate::transport::mqtt::MqttBus;

/// Build the blob store a settings block describes
pub fn build_blob_store(settings: &BlobSettings) -> Result<Arc<dyn BlobStore>, PlatformError> {
    match settings.kind {
        BlobKind::Fs => Ok(Arc::new(FsBlobStore::new(settings.root.clone()))),
        BlobKind::Http => {
            let endpoint = settings.endpoint.as_deref().ok_or_else(|| {
                PlatformError::ConfigError("blob.endpoint is required for the http store".to_string())
            })?;
            Ok(Arc::new(HttpBlobStore::new(endpoint, settings.token.clone())?))
        }
    }
}

/// Process-wide clients of the control plane
pub struct AppState {
    /// Projects, deployments and durable logs
    pub db: Arc<Db>,

    /// Published artifacts
    pub blob: Arc<dyn BlobStore>,

    /// Live log bus, if a broker is configured
    pub bus: Option<Arc<dyn PubSubBus>>,

    /// Executor launcher
    pub substrate: Arc<dyn LaunchSubstrate>,

    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, PlatformError> {
        info!("Initializing application state...");

        let db = Arc::new(Db::open(&options.database_path)?);
        let blob = build_blob_store(&options.blob)?;

        let bus: Option<Arc<dyn PubSubBus>> = if options.mqtt.is_configured() {
            let client_id = format!("shipyard-api-{}", Uuid::new_v4());
            Some(Arc::new(MqttBus::connect(&options.mqtt, &client_id).await?))
        } else {
            warn!("MQTT is not configured, live logs are disabled");
            None
        };

        let substrate: Arc<dyn LaunchSubstrate> = match &options.executor {
            Some(path) => Arc::new(LocalProcessSubstrate::new(path.clone(), vec!["--build".to_string()])),
            None => Arc::new(LocalProcessSubstrate::current_exe()?),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            substrate.clone(),
            options.launch.clone(),
            options.orchestrator.clone(),
        ));

        Ok(Self {
            db,
            blob,
            bus,
            substrate,
            orchestrator,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), PlatformError> {
        info!("Shutting down application state...");
        if let Some(bus) = &self.bus {
            bus.close().await?;
        }
        Ok(())
    }
}
