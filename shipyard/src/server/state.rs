//! Server state

use std::sync::Arc;
use std::time::Duration;

use crate::deploy::orchestrator::Orchestrator;
use crate::storage::blob::BlobStore;
use crate::storage::store::ProjectStore;
use crate::transport::durable::LogStore;
use crate::transport::live::PubSubBus;

/// API state shared across handlers
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub log_store: Arc<dyn LogStore>,
    /// `None` when live logs are disabled
    pub bus: Option<Arc<dyn PubSubBus>>,
    /// A live viewer slower than this is disconnected
    pub send_timeout: Duration,
}

impl ServerState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        log_store: Arc<dyn LogStore>,
        bus: Option<Arc<dyn PubSubBus>>,
    ) -> Self {
        Self {
            orchestrator,
            log_store,
            bus,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Reverse proxy state
pub struct ProxyState {
    pub store: Arc<dyn ProjectStore>,
    pub blob: Arc<dyn BlobStore>,
    pub bucket: String,
    pub directory_prefix: String,
}
